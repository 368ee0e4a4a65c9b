use serde::{Deserialize, Serialize};

/// Tokenized command invocation shared by every COMMAND component: a verb
/// followed by whitespace-separated arguments with single/double quoting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandArgs {
    pub verb: String,
    pub args: Vec<String>,
    pub raw: String,
}

impl CommandArgs {
    /// Parse the text after the leading `/`. Returns None for empty input.
    pub fn parse(text: &str) -> Option<Self> {
        let raw = text.trim();
        if raw.is_empty() {
            return None;
        }
        let tokens = tokenize(raw);
        let mut iter = tokens.into_iter();
        let verb = iter.next()?;
        Some(Self {
            verb,
            args: iter.collect(),
            raw: raw.to_string(),
        })
    }

    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    /// Argument at position `idx` after the subcommand.
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx + 1).map(|s| s.as_str())
    }

    /// Everything from position `idx` after the subcommand, re-joined.
    pub fn rest(&self, idx: usize) -> String {
        self.args
            .iter()
            .skip(idx + 1)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verb_and_args() {
        let args = CommandArgs::parse("permission grant qq 9 plugin.example.admin").unwrap();
        assert_eq!(args.verb, "permission");
        assert_eq!(args.subcommand(), Some("grant"));
        assert_eq!(args.arg(0), Some("qq"));
        assert_eq!(args.arg(1), Some("9"));
        assert_eq!(args.arg(2), Some("plugin.example.admin"));
    }

    #[test]
    fn test_quoted_arguments() {
        let args = CommandArgs::parse(r#"remind add "buy milk tomorrow" 'at 9'"#).unwrap();
        assert_eq!(args.args, vec!["add", "buy milk tomorrow", "at 9"]);
        assert_eq!(args.rest(0), "buy milk tomorrow at 9");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(CommandArgs::parse("   "), None);
        let bare = CommandArgs::parse("help").unwrap();
        assert_eq!(bare.verb, "help");
        assert!(bare.args.is_empty());
        assert_eq!(bare.subcommand(), None);
    }
}
