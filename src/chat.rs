//! Reserved-input handling for the interactive loop.

/// What one line of user input asks the loop to do. `exit` and `reset` are
/// reserved (case-insensitive); everything else becomes a human turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Reset,
    Say(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") {
            Command::Exit
        } else if line.eq_ignore_ascii_case("reset") {
            Command::Reset
        } else {
            Command::Say(line.to_string())
        }
    }
}

/// Splits a comma-separated list of image paths, dropping empty entries so
/// that an empty line means "no images".
pub fn parse_image_paths(line: &str) -> Vec<String> {
    line.split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_inputs() {
        assert_eq!(Command::parse("exit"), Command::Exit);
        assert_eq!(Command::parse("EXIT"), Command::Exit);
        assert_eq!(Command::parse(" reset \n"), Command::Reset);
        assert_eq!(
            Command::parse("tell me about this image"),
            Command::Say("tell me about this image".to_string())
        );
        // a message merely containing a reserved word is not reserved
        assert_eq!(
            Command::parse("exit strategy"),
            Command::Say("exit strategy".to_string())
        );
    }

    #[test]
    fn image_path_lists() {
        assert!(parse_image_paths("").is_empty());
        assert!(parse_image_paths("  ").is_empty());
        assert_eq!(
            parse_image_paths("a.jpg, b.png"),
            vec!["a.jpg".to_string(), "b.png".to_string()]
        );
        assert_eq!(parse_image_paths("a.jpg,"), vec!["a.jpg".to_string()]);
    }
}
