use std::fmt;

/// Location of a url mention: `url:line:column` plus an optional source excerpt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub url: String,
    /// 1-based line.
    pub line: Option<usize>,
    /// 0-based column.
    pub column: Option<usize>,
    pub snippet: Option<String>,
}

impl Trace {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Build a trace pointing inside `content` and capture a few lines around it.
    pub fn at(url: impl Into<String>, line: usize, column: usize, content: Option<&str>) -> Self {
        Self {
            url: url.into(),
            line: Some(line),
            column: Some(column),
            snippet: content.map(|c| source_snippet(c, line, column)),
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        if let Some(snippet) = &self.snippet {
            write!(f, "\n{snippet}")?;
        }
        Ok(())
    }
}

/// Render `line` (1-based) with one line of context on each side and a caret under `column`.
pub fn source_snippet(content: &str, line: usize, column: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if line == 0 || line > lines.len() {
        return String::new();
    }
    let first = line.saturating_sub(1).max(1);
    let last = (line + 1).min(lines.len());
    let width = last.to_string().len();
    let mut out = String::new();
    for n in first..=last {
        let marker = if n == line { ">" } else { " " };
        out.push_str(&format!("{marker}{n:>width$} | {}\n", lines[n - 1]));
        if n == line {
            out.push_str(&format!(" {} | {}^\n", " ".repeat(width), " ".repeat(column)));
        }
    }
    out.trim_end().to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveErrorKind {
    /// No plugin claimed the specifier.
    NoResolve,
    /// A plugin returned something that is not a url.
    InvalidUrl,
    /// A resolve, redirect or format hook threw.
    PluginError,
}

impl fmt::Display for ResolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolveErrorKind::NoResolve => "NO_RESOLVE",
            ResolveErrorKind::InvalidUrl => "INVALID_URL",
            ResolveErrorKind::PluginError => "PLUGIN_ERROR",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    NotFound,
    NotAllowed,
    DirectoryReferenceNotAllowed,
    ParseError,
    UnexpectedType,
    IntegrityMismatch,
    BadStatus(u16),
    NoHandler,
    /// Any other failure reported by a fetch hook.
    Failed,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::NotFound => f.write_str("NOT_FOUND"),
            FetchErrorKind::NotAllowed => f.write_str("NOT_ALLOWED"),
            FetchErrorKind::DirectoryReferenceNotAllowed => {
                f.write_str("DIRECTORY_REFERENCE_NOT_ALLOWED")
            }
            FetchErrorKind::ParseError => f.write_str("PARSE_ERROR"),
            FetchErrorKind::UnexpectedType => f.write_str("UNEXPECTED_TYPE"),
            FetchErrorKind::IntegrityMismatch => f.write_str("INTEGRITY_MISMATCH"),
            FetchErrorKind::BadStatus(status) => write!(f, "STATUS_{status}"),
            FetchErrorKind::NoHandler => f.write_str("NO_HANDLER"),
            FetchErrorKind::Failed => f.write_str("FAILED"),
        }
    }
}

/// Syntax error reported by a parse collaborator. Line is 1-based, column 0-based.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({line}:{column})")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    /// Shift the position so it points inside the file the content is embedded in.
    pub fn offset_by(&self, site_line: usize, site_column: usize) -> Self {
        let column = if self.line <= 1 {
            site_column + self.column
        } else {
            self.column
        };
        Self {
            message: self.message.clone(),
            line: site_line + self.line.saturating_sub(1),
            column,
        }
    }
}

/// Error a fetch hook returns to report a semantic failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct FetchFailure {
    pub kind: FetchErrorKind,
    pub reason: String,
}

impl FetchFailure {
    pub fn new(kind: FetchErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KitchenError {
    #[error("RESOLVE_URL_ERROR ({kind}): cannot resolve \"{specifier}\"\n{trace}\n{reason}")]
    ResolveUrl {
        kind: ResolveErrorKind,
        specifier: String,
        trace: Trace,
        reason: String,
    },

    #[error("FETCH_URL_CONTENT_ERROR ({kind}): {url}\n{trace}\n{reason}")]
    FetchUrlContent {
        kind: FetchErrorKind,
        url: String,
        trace: Trace,
        reason: String,
    },

    #[error("TRANSFORM_URL_CONTENT_ERROR in plugin \"{plugin}\": {url}\n{trace}\n{reason}")]
    TransformUrlContent {
        plugin: String,
        url: String,
        trace: Trace,
        reason: String,
        parse: Option<ParseError>,
    },

    #[error("FINALIZE_URL_CONTENT_ERROR in plugin \"{plugin}\": {url}\n{trace}\n{reason}")]
    FinalizeUrlContent {
        plugin: String,
        url: String,
        trace: Trace,
        reason: String,
    },

    #[error("plugin \"{plugin}\" broke the \"{hook}\" contract: {message}")]
    PluginContract {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("{0}")]
    ReferenceLifecycle(String),

    #[error("cannot version {url}: dependency {missing} has no content hash")]
    Versioning { url: String, missing: String },

    #[error("build invariant violated: {0}")]
    BuildInvariant(String),

    /// The node was modified while this cook was in flight; a newer cook owns it.
    #[error("cook of {url} was superseded by a newer modification")]
    Superseded { url: String },

    #[error("operation aborted")]
    Aborted,
}

impl KitchenError {
    pub fn code(&self) -> &'static str {
        match self {
            KitchenError::ResolveUrl { .. } => "RESOLVE_URL_ERROR",
            KitchenError::FetchUrlContent { .. } => "FETCH_URL_CONTENT_ERROR",
            KitchenError::TransformUrlContent { .. } => "TRANSFORM_URL_CONTENT_ERROR",
            KitchenError::FinalizeUrlContent { .. } => "FINALIZE_URL_CONTENT_ERROR",
            KitchenError::PluginContract { .. } => "PLUGIN_CONTRACT_ERROR",
            KitchenError::ReferenceLifecycle(_) => "REFERENCE_LIFECYCLE_ERROR",
            KitchenError::Versioning { .. } => "VERSIONING_ERROR",
            KitchenError::BuildInvariant(_) => "BUILD_INVARIANT_ERROR",
            KitchenError::Superseded { .. } => "SUPERSEDED",
            KitchenError::Aborted => "ABORT_ERROR",
        }
    }

    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            KitchenError::FetchUrlContent { kind, .. } => Some(*kind),
            KitchenError::TransformUrlContent { parse: Some(_), .. } => {
                Some(FetchErrorKind::ParseError)
            }
            _ => None,
        }
    }

    pub fn is_parse_error(&self) -> bool {
        self.fetch_kind() == Some(FetchErrorKind::ParseError)
    }
}

pub type KitchenResult<T> = Result<T, KitchenError>;
