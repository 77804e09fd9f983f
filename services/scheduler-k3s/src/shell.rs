//! Word splitting and quoting for commands that never go through a shell.
//!
//! Splitting and quoting follow `shlex`, variable references follow
//! `shellexpand` (`$NAME`, `${NAME}` and `${NAME:-default}`).

use std::borrow::Cow;

use crate::error::{Result, SchedulerError};

/// Stands in for `$` inside substituted values so the unset pass skips them.
const SHIELDED_DOLLAR: char = '\u{1}';

/// Split `input` into words. `what` names the command in the error.
pub fn split(what: &str, input: &str) -> Result<Vec<String>> {
    shlex::split(input).ok_or_else(|| {
        SchedulerError::config(format!(
            "Unable to parse {what} {input:?}: unbalanced quotes or trailing escape"
        ))
    })
}

/// Split `input` and expand variable references in every word.
///
/// Unset variables without a default expand to nothing, and a word that was
/// only such a reference is dropped. Expanded values are never re-split.
pub fn split_expanded<F>(what: &str, input: &str, lookup: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(split(what, input)?
        .into_iter()
        .filter_map(|word| {
            let expanded = expand(&word, &lookup);
            (word.is_empty() || !expanded.is_empty()).then_some(expanded)
        })
        .collect())
}

fn expand<F>(word: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if !word.contains('$') {
        return word.to_string();
    }
    let set = shellexpand::env_with_context_no_errors(word, |name: &str| {
        lookup(name).map(|value| value.replace('$', &SHIELDED_DOLLAR.to_string()))
    });
    shellexpand::env_with_context_no_errors(set.as_ref(), |_: &str| Some(""))
        .replace(SHIELDED_DOLLAR, "$")
}

/// Quote one word for a POSIX shell.
pub fn quote(word: &str) -> Result<Cow<'_, str>> {
    shlex::try_quote(word).map_err(|e| SchedulerError::config(format!("Unable to quote {word:?}: {e}")))
}

/// Join words into one POSIX shell command line.
pub fn join<S: AsRef<str>>(words: &[S]) -> Result<String> {
    shlex::try_join(words.iter().map(AsRef::as_ref))
        .map_err(|e| SchedulerError::config(format!("Unable to quote command: {e}")))
}
