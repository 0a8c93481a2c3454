// Configuration errors with helpful messages
// Provides location, source context, and suggestions for common mistakes

use std::fmt;

/// Error raised while loading or validating a job graph configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    /// Error message
    pub message: String,
    /// Dotted path inside the document (e.g. `jobs.test.strategy.matrix`)
    pub path: Option<String>,
    /// Line number (1-indexed), when known
    pub line: Option<usize>,
    /// Column number (1-indexed), when known
    pub column: Option<usize>,
    /// Surrounding source lines
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    /// The kind of error
    pub kind: ConfigErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Wrong types or missing fields
    InvalidSchema,
    /// Field not recognised
    UnknownField,
    /// Value out of range or malformed
    InvalidValue,
    /// `needs` references a job that does not exist
    UnknownDependency,
    /// Matrix axes, exclude or include rules are inconsistent
    InvalidMatrix,
    /// File could not be read
    Io,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            line: None,
            column: None,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ConfigErrorKind::InvalidValue, message)
    }

    pub fn invalid_matrix(message: impl Into<String>) -> Self {
        Self::new(ConfigErrorKind::InvalidMatrix, message)
    }

    pub fn unknown_dependency(job: &str, dependency: &str) -> Self {
        Self::new(
            ConfigErrorKind::UnknownDependency,
            format!("job '{}' depends on unknown job '{}'", job, dependency),
        )
        .at(format!("jobs.{}.needs", job))
    }

    pub fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::new(
            ConfigErrorKind::Io,
            format!("cannot read '{}': {}", path.display(), err),
        )
    }

    /// Attach a document path
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_location(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn with_suggestion_opt(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    /// Create context from source content around the error line
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        let Some(error_line) = self.line else {
            return self;
        };

        let lines: Vec<&str> = source.lines().collect();
        let start = error_line.saturating_sub(context_lines + 1);
        let end = (error_line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == error_line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == error_line {
                if let Some(column) = self.column.filter(|c| *c > 0) {
                    let indicator = " ".repeat(column - 1) + "^";
                    context.push_str(&format!("       | {}\n", indicator));
                }
            }
        }

        self.context = context;
        self
    }

    /// Create from a serde_yaml error, pointing into `source`
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let message = format_yaml_error_message(err);
        let kind = classify(&err.to_string());

        let mut error = ConfigError::new(kind, message);
        if let Some(location) = err.location() {
            let suggestion = suggest_yaml_fix(err, source, location.line());
            error = error
                .with_location(location.line(), location.column())
                .with_source_context(source, 2)
                .with_suggestion_opt(suggestion);
        }
        error
    }

    /// Create from a serde_yaml error raised while converting a sub-document
    pub fn from_value_error(err: &serde_yaml::Error, path: impl Into<String>) -> Self {
        ConfigError::new(classify(&err.to_string()), format_yaml_error_message(err)).at(path)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "config error at '{}': {}", path, self.message)?,
            None => write!(f, "config error: {}", self.message)?,
        }

        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, "\n  --> line {}:{}", line, column)?;
        }

        if !self.context.is_empty() {
            write!(f, "\n\n{}", self.context.trim_end())?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ConfigError {}

fn classify(msg: &str) -> ConfigErrorKind {
    if msg.contains("unknown field") {
        ConfigErrorKind::UnknownField
    } else if msg.contains("missing field") || msg.contains("invalid type") {
        ConfigErrorKind::InvalidSchema
    } else if msg.contains("invalid value") {
        ConfigErrorKind::InvalidValue
    } else {
        ConfigErrorKind::YamlSyntax
    }
}

/// Format serde_yaml error message into something more readable
fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if msg.contains("missing field") {
        if let Some(field) = extract_field_name(&msg, "missing field `", "`") {
            return format!("missing required field '{}'", field);
        }
    }

    if msg.contains("unknown field") {
        if let Some(field) = extract_field_name(&msg, "unknown field `", "`") {
            if let Some(expected) = extract_expected_fields(&msg) {
                return format!(
                    "unknown field '{}', expected one of: {}",
                    field,
                    expected.join(", ")
                );
            }
            return format!("unknown field '{}'", field);
        }
    }

    if msg.contains("invalid type") {
        return format_invalid_type_error(&msg);
    }

    msg
}

fn extract_field_name(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn extract_expected_fields(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let fields_str = &msg[start..];
    let end = fields_str.find(" at").unwrap_or(fields_str.len());
    let fields: Vec<String> = fields_str[..end]
        .split(", ")
        .map(|s| s.trim_matches('`').to_string())
        .collect();
    Some(fields)
}

fn format_invalid_type_error(msg: &str) -> String {
    if let (Some(found), Some(expected)) = (
        extract_field_name(msg, "invalid type: ", ","),
        extract_field_name(msg, "expected ", " at"),
    ) {
        return format!("expected {}, but found {}", expected, found);
    }
    msg.to_string()
}

/// Suggest fixes for common YAML mistakes in job graph files
fn suggest_yaml_fix(err: &serde_yaml::Error, source: &str, line: usize) -> Option<String> {
    let msg = err.to_string();
    let lines: Vec<&str> = source.lines().collect();
    let error_line = lines.get(line.saturating_sub(1)).unwrap_or(&"");

    if msg.contains("missing field `jobs`") {
        return Some("the file needs a top-level 'jobs:' mapping".to_string());
    }

    if msg.contains("missing field `run`") {
        return Some("every step needs a 'run:' command".to_string());
    }

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation. Replace tabs with spaces.".to_string());
    }

    let typo_suggestions = [
        ("depends-on", "needs"),
        ("dependson", "needs"),
        ("workingdirectory", "working-directory"),
        ("continueonerror", "continue-on-error"),
        ("timeout:", "timeout-minutes"),
        ("healthcheck", "health-check"),
        ("failfast", "fail-fast"),
    ];

    let lower_line = error_line.to_lowercase();
    for (typo, correct) in typo_suggestions {
        if lower_line.contains(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new(ConfigErrorKind::InvalidSchema, "missing required field 'run'")
            .at("jobs.lint.steps[0]")
            .with_location(10, 5)
            .with_suggestion("every step needs a 'run:' command");

        let output = format!("{}", err);
        assert!(output.contains("jobs.lint.steps[0]"));
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 10:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_config_error_with_source_context() {
        let source = "name: ci\njobs:\n  lint:\n    steps:\n      - nme: lint";

        let err = ConfigError::new(ConfigErrorKind::UnknownField, "unknown field 'nme'")
            .with_location(5, 9)
            .with_source_context(source, 2);

        assert!(err.context.contains(">    5 |       - nme: lint"));
        assert!(err.context.contains("^"));
    }

    #[test]
    fn test_from_yaml_error_has_location() {
        let source = "jobs:\n  lint: [unclosed";
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>(source).unwrap_err();

        let err = ConfigError::from_yaml_error(&yaml_err, source);

        assert!(err.line.is_some());
        assert!(!err.context.is_empty());
    }

    #[test]
    fn test_extract_field_name() {
        let msg = "missing field `steps` at line 10";
        assert_eq!(
            extract_field_name(msg, "missing field `", "`"),
            Some("steps".to_string())
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("jobs.lint: unknown field `stepz`, expected one of `steps`"),
            ConfigErrorKind::UnknownField
        );
        assert_eq!(
            classify("missing field `run` at line 3"),
            ConfigErrorKind::InvalidSchema
        );
    }
}
