use regex::Regex;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok());

// Matched against lowercased, ANSI-stripped stderr. Every term is bounded
// so ids, paths and line numbers that merely contain one do not match.
// Status codes only count next to an HTTP-ish word or their reason phrase.

const AUTH_PATTERNS: &[&str] = &[
    r"\bnot authenticated\b",
    r"\bnot logged in\b",
    r"\bunauthori[sz]ed\b",
    r"\bauthentication (?:failed|failure|required|error)\b",
    r"\blogin required\b",
    r"\bplease log ?in\b",
    r"\b(?:invalid|missing|expired|no) api[ _-]?key\b",
    r"\bapi[ _-]?key (?:is )?(?:invalid|missing|required|not set|not found|expired)\b",
    r"\b(?:http|status|code|error)\W{0,3}401\b",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"\brate[ -]?limit",
    r"\btoo many requests\b",
    r"\busage limit\b",
    r"\bquota\b",
    r"\b(?:http|status|code|error)\W{0,3}429\b",
];

const MODEL_PATTERNS: &[&str] = &[
    r"\bmodel (?:not found|unavailable|is not available)\b",
    r"\b(?:unknown|invalid|unsupported|no such) model\b",
];

const NETWORK_PATTERNS: &[&str] = &[
    r"\bnetwork (?:error|is unreachable|unreachable|request failed)\b",
    r"\b(?:econnrefused|econnreset|enotfound|etimedout|eai_again)\b",
    r"\bconnection (?:refused|reset)\b",
    r"\btimed out\b",
    r"\bsocket hang up\b",
    r"\bdns (?:lookup|resolution|error|failure)\b",
    r"\bgetaddrinfo\b",
];

/// One alternation per pattern group, in classification order.
static PATTERN_GROUPS: LazyLock<Vec<(CliFailureKind, Option<Regex>)>> = LazyLock::new(|| {
    [
        (CliFailureKind::NotAuthenticated, AUTH_PATTERNS),
        (CliFailureKind::RateLimited, RATE_LIMIT_PATTERNS),
        (CliFailureKind::ModelUnavailable, MODEL_PATTERNS),
        (CliFailureKind::Network, NETWORK_PATTERNS),
    ]
    .into_iter()
    .map(|(kind, patterns)| (kind, Regex::new(&patterns.join("|")).ok()))
    .collect()
});

/// Category of a failed CLI run, derived from its exit status and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFailureKind {
    /// Missing or expired credentials.
    NotAuthenticated,
    /// Quota or rate limit hit.
    RateLimited,
    /// The requested model is unknown or not enabled.
    ModelUnavailable,
    /// Connection failure or timeout.
    Network,
    /// Killed by a signal or interrupted.
    Terminated,
    /// Nothing recognizable in the output.
    Unknown,
}

impl CliFailureKind {
    /// Whether retrying later, unchanged, may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CliFailureKind::RateLimited | CliFailureKind::Network | CliFailureKind::Terminated
        )
    }

    /// Short heading for rendered errors.
    pub fn summary(&self) -> &'static str {
        match self {
            CliFailureKind::NotAuthenticated => "Not authenticated",
            CliFailureKind::RateLimited => "Rate limited",
            CliFailureKind::ModelUnavailable => "Model unavailable",
            CliFailureKind::Network => "Network error",
            CliFailureKind::Terminated => "Process terminated",
            CliFailureKind::Unknown => "CLI failed",
        }
    }

    /// Suggested next step for the operator.
    pub fn remediation(&self, provider: &str) -> String {
        match self {
            CliFailureKind::NotAuthenticated => {
                format!("Log in with the {provider} CLI or configure an API key, then retry.")
            }
            CliFailureKind::RateLimited => {
                "Wait for the usage window to reset, or switch to another model.".to_string()
            }
            CliFailureKind::ModelUnavailable => {
                format!("Check the model name against `drover models` for {provider}.")
            }
            CliFailureKind::Network => "Check network connectivity and retry.".to_string(),
            CliFailureKind::Terminated => {
                "The process was stopped externally; retry when ready.".to_string()
            }
            CliFailureKind::Unknown => {
                format!("Run the {provider} CLI manually to inspect the failure.")
            }
        }
    }
}

/// A classified CLI failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliFailure {
    /// Classified cause.
    pub kind: CliFailureKind,
    /// Exit code, absent when killed by a signal.
    pub exit_code: Option<i32>,
    /// Last meaningful stderr line.
    pub detail: String,
}

impl CliFailure {
    /// Classify a failed run from its exit code and stderr.
    pub fn classify(exit_code: Option<i32>, stderr: &str) -> Self {
        let clean = strip_ansi(stderr);
        Self {
            kind: classify_failure(exit_code, &clean),
            exit_code,
            detail: last_lines(&clean, exit_code),
        }
    }

    /// `summary: detail` followed by the remediation hint on its own line.
    pub fn render(&self, provider: &str) -> String {
        format!(
            "{}: {}\n{}",
            self.kind.summary(),
            self.detail,
            self.kind.remediation(provider)
        )
    }
}

/// Remove ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Classify by the first matching pattern group, checked in order:
/// authentication, rate limiting, model availability, network, termination.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> CliFailureKind {
    let haystack = strip_ansi(stderr).to_lowercase();
    let matched = PATTERN_GROUPS.iter().find_map(|(kind, re)| {
        re.as_ref()
            .filter(|re| re.is_match(&haystack))
            .map(|_| *kind)
    });

    match matched {
        Some(kind) => kind,
        None if matches!(exit_code, None | Some(130) | Some(137) | Some(143)) => {
            CliFailureKind::Terminated
        }
        None => CliFailureKind::Unknown,
    }
}

fn last_lines(stderr: &str, exit_code: Option<i32>) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return match exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        };
    }
    let start = lines.len().saturating_sub(3);
    let detail = lines[start..].join(" | ");
    if detail.len() > 500 {
        let mut end = 500;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &detail[..end])
    } else {
        detail
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth() {
        assert_eq!(
            classify_failure(Some(1), "Error: Not logged in. Run `login`."),
            CliFailureKind::NotAuthenticated
        );
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_failure(Some(1), "HTTP 429 Too Many Requests"),
            CliFailureKind::RateLimited
        );
    }

    #[test]
    fn test_auth_wins_over_rate_limit() {
        assert_eq!(
            classify_failure(Some(1), "401 unauthorized; also rate limit"),
            CliFailureKind::NotAuthenticated
        );
    }

    #[test]
    fn test_classify_model_and_network() {
        assert_eq!(
            classify_failure(Some(2), "unknown model 'gpt-9'"),
            CliFailureKind::ModelUnavailable
        );
        assert_eq!(
            classify_failure(Some(1), "connect ECONNREFUSED 127.0.0.1:443"),
            CliFailureKind::Network
        );
    }

    #[test]
    fn test_incidental_mentions_do_not_classify() {
        assert_eq!(
            classify_failure(Some(1), "panicked at src/main.rs:401:9"),
            CliFailureKind::Unknown
        );
        assert_eq!(
            classify_failure(Some(1), "cannot read /etc/dns/resolv.d/x: permission denied"),
            CliFailureKind::Unknown
        );
        assert_eq!(
            classify_failure(Some(1), "parsing api key rotation schedule failed"),
            CliFailureKind::Unknown
        );
        assert_eq!(
            classify_failure(Some(1), "request failed: status 401"),
            CliFailureKind::NotAuthenticated
        );
        assert_eq!(
            classify_failure(Some(1), "getaddrinfo ENOTFOUND api.openai.com"),
            CliFailureKind::Network
        );
        assert_eq!(
            classify_failure(Some(1), "Error: OPENAI_API_KEY is not set; missing api key"),
            CliFailureKind::NotAuthenticated
        );
    }

    #[test]
    fn test_signal_exit_is_terminated() {
        assert_eq!(classify_failure(None, ""), CliFailureKind::Terminated);
        assert_eq!(classify_failure(Some(143), "bye"), CliFailureKind::Terminated);
        assert_eq!(classify_failure(Some(1), "segfault"), CliFailureKind::Unknown);
    }

    #[test]
    fn test_ansi_is_stripped_before_matching() {
        let stderr = "\x1b[31mError:\x1b[0m \x1b[1mnot authenticated\x1b[0m";
        assert_eq!(strip_ansi(stderr), "Error: not authenticated");
        assert_eq!(classify_failure(Some(1), stderr), CliFailureKind::NotAuthenticated);
    }

    #[test]
    fn test_render_includes_hint() {
        let failure = CliFailure::classify(Some(1), "line one\nquota exceeded\n");
        let rendered = failure.render("codex");
        assert!(rendered.starts_with("Rate limited: line one | quota exceeded\n"));
        assert!(failure.kind.is_recoverable());
    }

    #[test]
    fn test_empty_stderr_detail() {
        let failure = CliFailure::classify(Some(5), "");
        assert_eq!(failure.detail, "exited with code 5");
        assert!(!failure.kind.is_recoverable());
    }
}
