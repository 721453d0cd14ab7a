/// Session commands and name resolution

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "update",
    aliases: &["u", "apply"],
    usage: "update",
    description: "Switch to the waiting version and reload",
  },
  Command {
    name: "get",
    aliases: &["g", "fetch"],
    usage: "get <path>",
    description: "Fetch a resource through the worker",
  },
  Command {
    name: "open",
    aliases: &["o", "nav", "navigate"],
    usage: "open [path]",
    description: "Navigate to a page through the worker",
  },
  Command {
    name: "status",
    aliases: &["st", "info"],
    usage: "status",
    description: "Show workers, controller and caches",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit clozeshell",
  },
];

/// Find the command a typed word names: an exact name or alias, or a
/// prefix of exactly one command name.
pub fn lookup(word: &str) -> Option<&'static Command> {
  lookup_in(COMMANDS, word)
}

fn lookup_in(table: &'static [Command], word: &str) -> Option<&'static Command> {
  let word = word.to_lowercase();
  if word.is_empty() {
    return None;
  }

  if let Some(cmd) = table
    .iter()
    .find(|cmd| cmd.name == word || cmd.aliases.contains(&word.as_str()))
  {
    return Some(cmd);
  }

  let mut prefixed = table.iter().filter(|cmd| cmd.name.starts_with(&word));
  match (prefixed.next(), prefixed.next()) {
    (Some(cmd), None) => Some(cmd),
    _ => None,
  }
}

/// Split a typed line into its command and the argument text.
pub fn resolve(line: &str) -> Option<(&'static Command, &str)> {
  let line = line.trim();
  let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
  lookup(word).map(|cmd| (cmd, rest.trim()))
}
