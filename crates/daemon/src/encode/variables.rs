//! Argument templates for encoder command lines.
//!
//! A template like `-o "{sd}/{sn}.mkv" --fps {fpsn}/{fpsd} -` is first split into
//! arguments (honoring quotes), then each argument has its `{token}`s replaced.
//! Splitting first keeps a substituted value with spaces in one argument.
//!
//! | token    | value                         |
//! |----------|-------------------------------|
//! | `{w}`    | clip width                    |
//! | `{h}`    | clip height                   |
//! | `{fpsn}` | fps numerator                 |
//! | `{fpsd}` | fps denominator               |
//! | `{fps}`  | fps as a decimal              |
//! | `{bits}` | bits per sample               |
//! | `{sd}`   | script directory              |
//! | `{sn}`   | script name without extension |
//! | `{f}`    | total frames to encode        |
//! | `{ss}`   | chroma subsampling            |
//! | `{o}`    | job output path               |
//!
//! `{{` produces a literal `{`.

use crate::frames::ClipInfo;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Error type for argument template expansion
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// `{name}` is not a known variable, or has no value for this job
    #[error("Unknown variable '{{{0}}}' in arguments")]
    UnknownVariable(String),

    /// A `{` without a matching `}`
    #[error("Unterminated variable in '{0}'")]
    UnterminatedVariable(String),

    /// A quote without its closing partner
    #[error("Unterminated quote in arguments")]
    UnterminatedQuote,
}

/// Values available for substitution in one job's command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableTable {
    values: BTreeMap<&'static str, String>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for an encode job. Clip variables are present only when `clip` is given.
    pub fn for_job(
        clip: Option<&ClipInfo>,
        script_name: &str,
        frames_total: u64,
        output_path: Option<&Path>,
    ) -> Self {
        let mut table = Self::new();

        if let Some(clip) = clip {
            table.set("w", clip.width.to_string());
            table.set("h", clip.height.to_string());
            table.set("fpsn", clip.fps_num.to_string());
            table.set("fpsd", clip.fps_den.to_string());
            table.set("fps", format_fps(clip.fps()));
            table.set("bits", clip.bits_per_sample.to_string());
            table.set("ss", clip.subsampling.as_str().to_string());
            table.set("f", frames_total.to_string());
        }

        let script = Path::new(script_name);
        let dir = script
            .parent()
            .map(|p| p.display().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| ".".to_string());
        table.set("sd", dir);
        table.set(
            "sn",
            script
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );

        if let Some(output) = output_path {
            table.set("o", output.display().to_string());
        }

        table
    }

    pub fn set(&mut self, token: &'static str, value: impl Into<String>) {
        self.values.insert(token, value.into());
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.values.get(token).map(String::as_str)
    }

    /// Replace every `{token}` in `text`.
    pub fn substitute(&self, text: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            if let Some(stripped) = after.strip_prefix('{') {
                out.push('{');
                rest = stripped;
                continue;
            }
            let close = after
                .find('}')
                .ok_or_else(|| TemplateError::UnterminatedVariable(text.to_string()))?;
            let name = &after[..close];
            let value = self
                .get(name)
                .ok_or_else(|| TemplateError::UnknownVariable(name.to_string()))?;
            out.push_str(value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Split `template` into arguments and substitute each one.
    pub fn expand_arguments(&self, template: &str) -> Result<Vec<String>, TemplateError> {
        split_arguments(template)?
            .iter()
            .map(|arg| self.substitute(arg))
            .collect()
    }
}

fn format_fps(fps: f64) -> String {
    let s = format!("{:.3}", fps);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

/// Split a command line on whitespace, honoring single and double quotes.
///
/// Inside double quotes `\"` and `\\` are escapes; everywhere else a backslash
/// is literal so Windows paths survive.
pub fn split_arguments(line: &str) -> Result<Vec<String>, TemplateError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') if matches!(chars.peek(), Some('"') | Some('\\')) => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some(other) => current.push(other),
                        None => return Err(TemplateError::UnterminatedQuote),
                    }
                }
            }
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(other) => current.push(other),
                        None => return Err(TemplateError::UnterminatedQuote),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            other => {
                in_arg = true;
                current.push(other);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}
