//! Build description parser.
//!
//! Parses a Dockerfile subset into an ordered list of steps, each tagged
//! with the physical line it starts on. Supports line continuations (`\`),
//! comments, and both shell and JSON (exec) forms for RUN/CMD/ENTRYPOINT.
//!
//! Instructions without build meaning here (EXPOSE, USER, VOLUME, ...) are
//! rejected instead of skipped, so a description never builds to something
//! other than what it says.

use std::fmt;
use std::path::Path;

use stratum_core::error::{Result, StratumError};

/// A single build instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image>`
    From { image: String },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { vars: Vec<(String, String)> },
    /// `COPY <src>... <dst>`
    Copy { src: Vec<String>, dst: String },
    /// `RUN <command>`
    Run { command: String },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
    /// `LABEL <key>=<value> ...`
    Label { labels: Vec<(String, String)> },
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Copy { .. } => "COPY",
            Instruction::Run { .. } => "RUN",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Arg { .. } => "ARG",
            Instruction::Label { .. } => "LABEL",
        }
    }

    /// Whether executing this instruction changes the filesystem.
    pub fn produces_layer(&self) -> bool {
        matches!(self, Instruction::Copy { .. } | Instruction::Run { .. })
    }
}

/// Canonical text: stable across whitespace and quoting differences in the
/// source, so it can feed stage keys and image history.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From { image } => write!(f, "FROM {}", image),
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Env { vars } => write!(f, "ENV {}", join_pairs(vars)),
            Instruction::Copy { src, dst } => {
                let words: Vec<&str> = src.iter().map(String::as_str).chain([dst.as_str()]).collect();
                write!(f, "COPY {}", shell_words::join(words))
            }
            Instruction::Run { command } => write!(f, "RUN {}", command),
            Instruction::Cmd { exec } => write!(f, "CMD {}", json_array(exec)),
            Instruction::Entrypoint { exec } => write!(f, "ENTRYPOINT {}", json_array(exec)),
            Instruction::Arg { name, default } => match default {
                Some(d) => write!(f, "ARG {}={}", name, shell_words::quote(d)),
                None => write!(f, "ARG {}", name),
            },
            Instruction::Label { labels } => write!(f, "LABEL {}", join_pairs(labels)),
        }
    }
}

fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_words::quote(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

/// An instruction and the line it starts on (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub line: usize,
    pub instruction: Instruction,
}

/// Parsed build description: steps in order.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub steps: Vec<Step>,
}

impl Dockerfile {
    /// Parse a build description from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (line, text) in join_continuation_lines(content) {
            let instruction = parse_instruction(&text, line)?;
            steps.push(Step { line, instruction });
        }

        if steps.is_empty() {
            return Err(parse_error(
                1,
                "build description is empty or contains no instructions",
            ));
        }

        let first_non_arg = steps
            .iter()
            .find(|s| !matches!(s.instruction, Instruction::Arg { .. }));
        match first_non_arg {
            Some(Step {
                instruction: Instruction::From { .. },
                ..
            }) => {}
            Some(step) => {
                return Err(parse_error(
                    step.line,
                    "first instruction must be FROM (or ARG before FROM)",
                ))
            }
            None => return Err(parse_error(1, "missing FROM instruction")),
        }

        if let Some(second_from) = steps
            .iter()
            .filter(|s| matches!(s.instruction, Instruction::From { .. }))
            .nth(1)
        {
            return Err(parse_error(
                second_from.line,
                "multi-stage builds are not supported",
            ));
        }

        Ok(Dockerfile { steps })
    }

    /// Parse a build description from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::BuildError(format!(
                "Failed to read build description at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.steps.iter().map(|s| &s.instruction)
    }

    /// The image named by FROM.
    pub fn base_image(&self) -> Option<&str> {
        self.instructions().find_map(|i| match i {
            Instruction::From { image } => Some(image.as_str()),
            _ => None,
        })
    }
}

/// Join continued lines into logical lines, keeping each one's starting
/// line number. Comment lines inside a continuation are dropped.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if current.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            start = idx + 1;
        } else if trimmed.starts_with('#') {
            continue;
        }

        match trimmed.strip_suffix('\\') {
            Some(body) => {
                current.push_str(body.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(trimmed);
                logical.push((start, current.trim().to_string()));
                current.clear();
            }
        }
    }

    // Trailing continuation without a final line
    if !current.trim().is_empty() {
        logical.push((start, current.trim().to_string()));
    }

    logical
}

fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);

    match keyword.to_uppercase().as_str() {
        "FROM" => parse_from(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "CMD" => Ok(Instruction::Cmd {
            exec: parse_exec(rest, "CMD", line_num)?,
        }),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint {
            exec: parse_exec(rest, "ENTRYPOINT", line_num)?,
        }),
        "ARG" => parse_arg(rest, line_num),
        "LABEL" => Ok(Instruction::Label {
            labels: parse_pairs(rest, "LABEL", line_num)?,
        }),
        "ADD" | "EXPOSE" | "USER" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK"
        | "ONBUILD" | "MAINTAINER" => Err(parse_error(
            line_num,
            format!("unsupported instruction '{}'", keyword.to_uppercase()),
        )),
        _ => Err(parse_error(
            line_num,
            format!("unknown instruction '{}'", keyword),
        )),
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> StratumError {
    StratumError::Parse {
        line,
        message: message.into(),
    }
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn split_words(rest: &str, line_num: usize) -> Result<Vec<String>> {
    shell_words::split(rest)
        .map_err(|e| parse_error(line_num, format!("cannot split arguments: {}", e)))
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [image] => Ok(Instruction::From {
            image: image.to_string(),
        }),
        [_, as_kw, _] if as_kw.eq_ignore_ascii_case("AS") => Err(parse_error(
            line_num,
            "multi-stage builds are not supported",
        )),
        [] => Err(parse_error(line_num, "FROM requires an image argument")),
        _ => Err(parse_error(line_num, "FROM takes exactly one image")),
    }
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(parse_error(line_num, "WORKDIR requires a path"));
    }
    Ok(Instruction::Workdir {
        path: rest.to_string(),
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(parse_error(line_num, "ENV requires a key and value"));
    }

    let (first, after) = split_first_word(rest);
    let vars = if first.contains('=') {
        parse_pairs(rest, "ENV", line_num)?
    } else {
        // Legacy form: ENV KEY VALUE
        if after.is_empty() {
            return Err(parse_error(
                line_num,
                format!("ENV {} is missing a value", first),
            ));
        }
        vec![(first.to_string(), unquote(after))]
    };

    for (key, _) in &vars {
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(parse_error(line_num, format!("invalid ENV name '{}'", key)));
        }
    }

    Ok(Instruction::Env { vars })
}

/// `KEY=VALUE` pairs, values optionally quoted.
fn parse_pairs(rest: &str, keyword: &str, line_num: usize) -> Result<Vec<(String, String)>> {
    let words = split_words(rest, line_num)?;
    if words.is_empty() {
        return Err(parse_error(
            line_num,
            format!("{} requires at least one KEY=VALUE pair", keyword),
        ));
    }

    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(parse_error(
                line_num,
                format!("{} expects KEY=VALUE, got '{}'", keyword, word),
            )),
        })
        .collect()
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let parts = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?
    } else {
        split_words(rest, line_num)?
    };

    if let Some(flag) = parts.iter().find(|p| p.starts_with("--")) {
        let message = if flag.starts_with("--from") {
            "COPY --from is not supported (single-stage builds only)".to_string()
        } else {
            format!("unsupported COPY flag '{}'", flag)
        };
        return Err(parse_error(line_num, message));
    }

    match parts.split_last() {
        Some((dst, src)) if !src.is_empty() => Ok(Instruction::Copy {
            src: src.to_vec(),
            dst: dst.clone(),
        }),
        _ => Err(parse_error(
            line_num,
            "COPY requires at least one source and a destination",
        )),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(parse_error(line_num, "RUN requires a command"));
    }

    let command = if rest.starts_with('[') {
        shell_words::join(parse_json_array(rest, line_num)?)
    } else {
        rest.to_string()
    };

    Ok(Instruction::Run { command })
}

fn parse_exec(rest: &str, keyword: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(parse_error(
            line_num,
            format!("{} requires an argument", keyword),
        ));
    }

    let exec = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?
    } else {
        // Shell form: wrap in sh -c
        vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()]
    };

    if exec.is_empty() {
        return Err(parse_error(
            line_num,
            format!("{} exec form must not be empty", keyword),
        ));
    }
    Ok(exec)
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    let words = split_words(rest, line_num)?;
    let [word] = words.as_slice() else {
        return Err(parse_error(line_num, "ARG takes exactly one name[=default]"));
    };

    let (name, default) = match word.split_once('=') {
        Some((n, d)) => (n.to_string(), Some(d.to_string())),
        None => (word.clone(), None),
    };
    if name.is_empty() {
        return Err(parse_error(line_num, "ARG requires a name"));
    }

    Ok(Instruction::Arg { name, default })
}

fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str::<Vec<String>>(s)
        .map_err(|e| parse_error(line_num, format!("invalid JSON array: {}", e)))
}

/// Remove surrounding quotes, if any.
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}
