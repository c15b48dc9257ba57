use crate::process::find_in_path;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Host platform a backend is being driven from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    /// Windows; POSIX-only CLIs are reached through WSL.
    Windows,
    /// Linux, macOS, and other Unix-likes.
    Posix,
}

impl HostPlatform {
    /// Platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            HostPlatform::Windows
        } else {
            HostPlatform::Posix
        }
    }
}

/// Translate a host filesystem path into the path WSL sees.
///
/// `C:\Users\me` becomes `/mnt/c/Users/me`, and UNC paths into a WSL
/// distribution (`\\wsl$\Ubuntu\home\me`, `\\wsl.localhost\Ubuntu\home\me`)
/// become the distribution-local `/home/me`. Anything else only has its
/// separators normalized.
pub fn to_wsl_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let bytes = raw.as_bytes();

    let unc = raw
        .strip_prefix(r"\\wsl$\")
        .or_else(|| raw.strip_prefix(r"\\wsl.localhost\"))
        .or_else(|| raw.strip_prefix("//wsl$/"))
        .or_else(|| raw.strip_prefix("//wsl.localhost/"));
    if let Some(rest) = unc {
        let rest = rest.replace('\\', "/");
        return match rest.split_once('/') {
            Some((_distro, tail)) => format!("/{}", tail.trim_start_matches('/')),
            None => "/".to_string(),
        };
    }

    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let tail = raw[2..].replace('\\', "/");
        let tail = tail.trim_start_matches('/');
        return if tail.is_empty() {
            format!("/mnt/{drive}")
        } else {
            format!("/mnt/{drive}/{tail}")
        };
    }

    raw.replace('\\', "/")
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds `wsl.exe` invocations for a distribution.
#[derive(Debug, Clone, Default)]
pub struct WslShell {
    /// `None` uses the WSL default distribution.
    pub distro: Option<String>,
}

impl WslShell {
    /// Shell for `distro`, or the default distribution.
    pub fn new(distro: Option<String>) -> Self {
        Self { distro }
    }

    fn prefix(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(distro) = &self.distro {
            args.push("-d".to_string());
            args.push(distro.clone());
        }
        args.push("--".to_string());
        args
    }

    /// Program and arguments that run `binary args...` inside WSL in the
    /// translated `cwd`, through a login shell so the user's PATH applies.
    pub fn invocation(&self, binary: &str, args: &[String], cwd: &Path) -> (String, Vec<String>) {
        let mut script = format!("cd {} && {}", shell_quote(&to_wsl_path(cwd)), shell_quote(binary));
        for arg in args {
            script.push(' ');
            script.push_str(&shell_quote(arg));
        }
        let mut full = self.prefix();
        full.extend(["bash".to_string(), "-lc".to_string(), script]);
        ("wsl.exe".to_string(), full)
    }

    /// Run a short shell snippet inside WSL, returning exit status and stdout.
    pub async fn run_snippet(&self, snippet: &str) -> Option<(bool, String)> {
        let mut args = self.prefix();
        args.extend(["bash".to_string(), "-lc".to_string(), snippet.to_string()]);
        run_capture("wsl.exe", &args).await
    }
}

/// Run a command to completion with a short timeout.
pub(crate) async fn run_capture(program: &str, args: &[String]) -> Option<(bool, String)> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            Some((out.status.success(), text))
        }
        Ok(Err(e)) => {
            debug!(program, error = %e, "probe command failed to start");
            None
        }
        Err(_) => {
            debug!(program, "probe command timed out");
            None
        }
    }
}

/// Filesystem and PATH queries against one environment (native or WSL).
///
/// Paths are strings in the probed environment's own syntax.
#[async_trait]
pub trait ShellProbe: Send + Sync {
    /// Resolve a command name on PATH.
    async fn which(&self, name: &str) -> Option<String>;
    async fn is_file(&self, path: &str) -> bool;
    /// Entry names in a directory; empty if it does not exist.
    async fn list_dir(&self, path: &str) -> Vec<String>;
    async fn read_to_string(&self, path: &str) -> Option<String>;
    async fn home_dir(&self) -> Option<String>;
}

/// Probes the host the process runs on.
#[derive(Debug, Clone, Default)]
pub struct NativeProbe;

#[async_trait]
impl ShellProbe for NativeProbe {
    async fn which(&self, name: &str) -> Option<String> {
        find_in_path(name).map(|p| p.to_string_lossy().into_owned())
    }

    async fn is_file(&self, path: &str) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn list_dir(&self, path: &str) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(path).await else {
            return names;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names
    }

    async fn read_to_string(&self, path: &str) -> Option<String> {
        tokio::fs::read_to_string(path).await.ok()
    }

    async fn home_dir(&self) -> Option<String> {
        dirs::home_dir().map(|p| p.to_string_lossy().into_owned())
    }
}

/// Probes a WSL distribution from a Windows host.
#[derive(Debug, Clone, Default)]
pub struct WslProbe {
    /// Shell commands are run through.
    pub shell: WslShell,
}

impl WslProbe {
    /// Probe running through `shell`.
    pub fn new(shell: WslShell) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl ShellProbe for WslProbe {
    async fn which(&self, name: &str) -> Option<String> {
        let (ok, out) = self
            .shell
            .run_snippet(&format!("command -v {}", shell_quote(name)))
            .await?;
        let path = out.lines().next()?.trim().to_string();
        (ok && !path.is_empty()).then_some(path)
    }

    async fn is_file(&self, path: &str) -> bool {
        matches!(
            self.shell.run_snippet(&format!("test -f {}", shell_quote(path))).await,
            Some((true, _))
        )
    }

    async fn list_dir(&self, path: &str) -> Vec<String> {
        match self
            .shell
            .run_snippet(&format!("ls -1 {} 2>/dev/null", shell_quote(path)))
            .await
        {
            Some((true, out)) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn read_to_string(&self, path: &str) -> Option<String> {
        match self
            .shell
            .run_snippet(&format!("cat {} 2>/dev/null", shell_quote(path)))
            .await
        {
            Some((true, out)) => Some(out),
            _ => None,
        }
    }

    async fn home_dir(&self) -> Option<String> {
        let (ok, out) = self.shell.run_snippet(r#"printf '%s' "$HOME""#).await?;
        let home = out.trim().to_string();
        (ok && !home.is_empty()).then_some(home)
    }
}

/// Where to look for a CLI binary.
#[derive(Debug, Clone, Default)]
pub struct BinarySearch {
    /// Binary name.
    pub name: String,
    /// Absolute paths checked after PATH, in order.
    pub conventional: Vec<String>,
    /// Directory holding one sub-directory per installed version.
    pub versions_dir: Option<String>,
}

/// Find a binary: PATH first, then conventional locations, then the greatest
/// version directory that contains it.
pub async fn discover_binary(probe: &dyn ShellProbe, search: &BinarySearch) -> Option<String> {
    if let Some(path) = probe.which(&search.name).await {
        return Some(path);
    }
    for candidate in &search.conventional {
        if probe.is_file(candidate).await {
            return Some(candidate.clone());
        }
    }
    let dir = search.versions_dir.as_deref()?;
    let mut versions = probe.list_dir(dir).await;
    versions.sort();
    for version in versions.iter().rev() {
        let candidate = format!("{}/{}/{}", dir.trim_end_matches('/'), version, search.name);
        if probe.is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

/// How a backend was found to be authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSource {
    /// A token supplied through configuration or the environment.
    Token,
    /// A credential file in the compatibility environment (WSL on Windows).
    CompatCredentials(String),
    /// A credential file on the host itself.
    NativeCredentials(String),
    /// The CLI's own status command reported a login.
    CliStatus,
}

impl AuthSource {
    /// Credential source as reported in installation status.
    pub fn method(&self) -> &'static str {
        match self {
            AuthSource::Token => "api_key",
            AuthSource::CompatCredentials(_) | AuthSource::NativeCredentials(_) => "credentials_file",
            AuthSource::CliStatus => "cli_login",
        }
    }
}

/// Inputs to [`discover_auth`], excluding the live status probe.
#[derive(Debug, Clone, Default)]
pub struct AuthSearch {
    /// Token from config or the environment.
    pub token: Option<String>,
    /// Credential files looked up inside WSL.
    pub compat_credentials: Vec<String>,
    /// Credential files looked up on the host.
    pub native_credentials: Vec<String>,
}

/// Check the cheap authentication sources in order: token, compatibility
/// environment credentials, then native credentials. `None` means the caller
/// should fall back to a live status probe.
pub async fn discover_auth(
    compat: &dyn ShellProbe,
    native: &dyn ShellProbe,
    search: &AuthSearch,
) -> Option<AuthSource> {
    if search.token.as_deref().is_some_and(|t| !t.trim().is_empty()) {
        return Some(AuthSource::Token);
    }
    for path in &search.compat_credentials {
        if has_content(compat, path).await {
            return Some(AuthSource::CompatCredentials(path.clone()));
        }
    }
    for path in &search.native_credentials {
        if has_content(native, path).await {
            return Some(AuthSource::NativeCredentials(path.clone()));
        }
    }
    None
}

async fn has_content(probe: &dyn ShellProbe, path: &str) -> bool {
    probe
        .read_to_string(path)
        .await
        .is_some_and(|c| !c.trim().is_empty())
}
