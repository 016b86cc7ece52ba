use regex::Regex;

use crate::core::domain::RunStatus;

const RESULT_LINE_PATTERN: &str = r"^\s*Result\s*of\s*(?:this)?\s*[Aa]lgorithm\s*[Rr]un\s*:";
const LEGACY_RESULT_LINE_PATTERN: &str =
    r"^\s*(?:Final)?\s*[Rr]esult\s+(?:[Ff]or|[oO]f)\s+(?:HAL|ParamILS|SMAC|[tT]his [wW]rapper):";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResultLineError {
    #[error("not enough arguments, expected at least 5 fields but got {0}")]
    NotEnoughFields(usize),

    #[error("unknown status {0:?}")]
    UnknownStatus(String),

    #[error("status {0} is not allowed in wrapper output")]
    ForbiddenStatus(RunStatus),

    #[error("invalid number format in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResultLine {
    pub status: RunStatus,
    pub runtime: f64,
    pub runlength: f64,
    pub quality: f64,
    pub seed: i64,
    pub additional_data: String,
}

/// Recognizes result lines in target algorithm output.
#[derive(Debug, Clone)]
pub struct ResultLineParser {
    patterns: [Regex; 2],
}

impl ResultLineParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: [
                Regex::new(RESULT_LINE_PATTERN)?,
                Regex::new(LEGACY_RESULT_LINE_PATTERN)?,
            ],
        })
    }

    pub fn is_result_line(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }

    /// Returns `None` for ordinary output lines.
    pub fn parse(&self, line: &str) -> Option<Result<ParsedResultLine, ResultLineError>> {
        if !self.is_result_line(line) {
            return None;
        }
        let (_, payload) = line.split_once(':')?;
        Some(parse_fields(payload))
    }
}

fn parse_fields(payload: &str) -> Result<ParsedResultLine, ResultLineError> {
    let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return Err(ResultLineError::NotEnoughFields(fields.len()));
    }
    if fields.len() > 6 {
        tracing::warn!(
            "Result line has {} fields, everything after the 6th is ignored. Additional data may not contain commas",
            fields.len()
        );
    }

    let status: RunStatus = fields[0]
        .parse()
        .map_err(|_| ResultLineError::UnknownStatus(fields[0].to_string()))?;
    if !status.is_permitted_by_wrappers() {
        return Err(ResultLineError::ForbiddenStatus(status));
    }

    Ok(ParsedResultLine {
        status,
        runtime: parse_number("runtime", fields[1])?,
        runlength: parse_number("runlength", fields[2])?,
        quality: parse_number("quality", fields[3])?,
        seed: fields[4]
            .parse()
            .map_err(|_| ResultLineError::InvalidNumber {
                field: "seed",
                value: fields[4].to_string(),
            })?,
        additional_data: fields.get(5).map(|s| s.to_string()).unwrap_or_default(),
    })
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, ResultLineError> {
    value.parse().map_err(|_| ResultLineError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}
