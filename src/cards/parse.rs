//! Cloze parsing for the two authoring modes.

/// What a blanked-out term is replaced with in the question.
pub const BLANK: &str = "_____";

/// A sentence with its deletions taken out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cloze {
  pub question: String,
  pub answers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
  #[error("card text is empty")]
  Empty,
  #[error("no deletions: mark terms with {{{{...}}}} or list them after `|`")]
  NoDeletions,
  #[error("unclosed `{{{{` in card text")]
  Unclosed,
  #[error("empty `{{{{}}}}` deletion")]
  EmptyDeletion,
  #[error("answer {0:?} does not appear in the sentence")]
  AnswerNotFound(String),
}

/// Parse raw card text.
///
/// Inline mode: `The {{mitochondria}} is the powerhouse of the cell`.
/// Explicit mode: `The mitochondria is the powerhouse | mitochondria; powerhouse`,
/// blanking the first occurrence of each listed answer.
pub fn parse(raw: &str) -> Result<Cloze, ParseError> {
  let raw = raw.trim();
  if raw.is_empty() {
    return Err(ParseError::Empty);
  }

  if raw.contains("{{") {
    parse_inline(raw)
  } else if let Some((sentence, answers)) = raw.split_once('|') {
    parse_explicit(sentence.trim(), answers)
  } else {
    Err(ParseError::NoDeletions)
  }
}

fn parse_inline(raw: &str) -> Result<Cloze, ParseError> {
  let mut question = String::with_capacity(raw.len());
  let mut answers = Vec::new();
  let mut rest = raw;

  while let Some(start) = rest.find("{{") {
    question.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let end = after.find("}}").ok_or(ParseError::Unclosed)?;

    let term = after[..end].trim();
    if term.is_empty() {
      return Err(ParseError::EmptyDeletion);
    }
    answers.push(term.to_string());
    question.push_str(BLANK);
    rest = &after[end + 2..];
  }
  question.push_str(rest);

  Ok(Cloze { question, answers })
}

fn parse_explicit(sentence: &str, answers: &str) -> Result<Cloze, ParseError> {
  let answers: Vec<String> = answers
    .split(';')
    .map(str::trim)
    .filter(|a| !a.is_empty())
    .map(String::from)
    .collect();

  if answers.is_empty() {
    return Err(ParseError::NoDeletions);
  }

  let mut question = sentence.to_string();
  for answer in &answers {
    if !question.contains(answer.as_str()) {
      return Err(ParseError::AnswerNotFound(answer.clone()));
    }
    question = question.replacen(answer.as_str(), BLANK, 1);
  }

  Ok(Cloze { question, answers })
}
