//! Credential Broker - Privileged Session Lifecycle
//!
//! Validates the user's password against sudo, then hands out a borrowed
//! [`Escalation`] capability that re-runs commands as root without prompting.
//!
//! The secret lives only in memory (`Zeroizing`) and reaches children through
//! a single environment variable. The generated wrapper script holds no secret
//! and is created owner-only (0700). At most one session exists per process.

use dvr_common::config::EscalationConfig;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use zeroize::Zeroizing;

/// Set while any broker in this process holds an active session
static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// Authentication failures; all of them leave the session inactive
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Password must not be empty")]
    EmptyPassword,

    #[error("Authentication failed: incorrect password")]
    Rejected,

    #[error("A privileged session is already active")]
    AlreadyActive,

    #[error("No active privileged session")]
    NoActiveSession,

    #[error("Could not run {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create escalation wrapper: {0}")]
    Wrapper(#[source] io::Error),
}

/// Releases the process-wide session flag when dropped
struct SessionGuard;

impl SessionGuard {
    fn acquire() -> Option<Self> {
        SESSION_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionGuard)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION_LIVE.store(false, Ordering::Release);
    }
}

struct ActiveSession {
    secret: Zeroizing<String>,
    wrapper: TempPath,
    _guard: SessionGuard,
}

/// Owns the privileged session
pub struct CredentialBroker {
    config: EscalationConfig,
    session: Option<ActiveSession>,
}

impl CredentialBroker {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Whether a validated session is currently held
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Validate `password` and start a session.
    ///
    /// Any cached sudo ticket is dropped first so a stale, unrelated
    /// ticket cannot make a wrong password look valid. On failure the
    /// password is dropped (and zeroized) immediately.
    pub async fn begin_session(&mut self, password: Zeroizing<String>) -> Result<(), AuthError> {
        if self.session.is_some() {
            return Err(AuthError::AlreadyActive);
        }

        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }

        let guard = SessionGuard::acquire().ok_or(AuthError::AlreadyActive)?;

        self.invalidate_cached_ticket().await?;

        if !self.verify_password(&password).await? {
            tracing::info!("sudo rejected the password");
            return Err(AuthError::Rejected);
        }

        let script = wrapper_script(&self.config.program, &self.config.secret_env);
        let wrapper = write_wrapper(&self.config.wrapper_dir(), &script)
            .map_err(AuthError::Wrapper)?;

        tracing::info!("Privileged session started (wrapper {:?})", &*wrapper);

        self.session = Some(ActiveSession {
            secret: password,
            wrapper,
            _guard: guard,
        });

        Ok(())
    }

    /// Borrow the escalation capability for the active session
    pub fn escalation_capability(&self) -> Result<Escalation<'_>, AuthError> {
        let session = self.session.as_ref().ok_or(AuthError::NoActiveSession)?;

        Ok(Escalation {
            wrapper: &*session.wrapper,
            secret_env: &self.config.secret_env,
            secret: &session.secret,
        })
    }

    /// Environment additions needed by the wrapper: exactly the secret
    pub fn environment_overlay(&self) -> Result<EnvOverlay, AuthError> {
        Ok(self.escalation_capability()?.overlay())
    }

    /// End the session: erase the secret, drop any sudo ticket and delete
    /// the wrapper. Idempotent.
    pub fn end_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        // synchronous so it also runs from Drop
        match std::process::Command::new(&self.config.program)
            .arg("-k")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!("Clearing the sudo ticket exited with {}", status),
            Err(e) => tracing::warn!("Failed to clear the sudo ticket: {}", e),
        }

        let ActiveSession {
            secret,
            wrapper,
            _guard,
        } = session;
        drop(secret);

        let path = wrapper.to_path_buf();
        match wrapper.close() {
            Ok(()) => tracing::debug!("Removed escalation wrapper {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove escalation wrapper {:?}: {}", path, e),
        }

        tracing::info!("Privileged session ended");
    }

    async fn invalidate_cached_ticket(&self) -> Result<(), AuthError> {
        let status = Command::new(&self.config.program)
            .arg("-k")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| self.launch_error(source))?;

        if !status.success() {
            tracing::warn!("Clearing the cached sudo ticket exited with {}", status);
        }

        Ok(())
    }

    /// Run a no-op as root, feeding the password on stdin
    async fn verify_password(&self, password: &str) -> Result<bool, AuthError> {
        let mut child = Command::new(&self.config.program)
            .args(["-S", "-k", "-p", "", "--", "true"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.launch_error(source))?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = Zeroizing::new(String::with_capacity(password.len() + 1));
            line.push_str(password);
            line.push('\n');
            // a closed pipe just means sudo gave up early; the exit status decides
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::debug!("Password pipe closed early: {}", e);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|source| self.launch_error(source))?;

        Ok(status.success())
    }

    fn launch_error(&self, source: io::Error) -> AuthError {
        AuthError::Launch {
            program: self.config.program.display().to_string(),
            source,
        }
    }
}

impl Drop for CredentialBroker {
    fn drop(&mut self) {
        self.end_session();
    }
}

/// Borrowed capability to run commands as root under the active session
#[derive(Clone, Copy)]
pub struct Escalation<'a> {
    wrapper: &'a Path,
    secret_env: &'a str,
    secret: &'a Zeroizing<String>,
}

impl<'a> Escalation<'a> {
    /// Path of the generated wrapper (usable as a sudo replacement)
    pub fn wrapper_path(&self) -> &'a Path {
        self.wrapper
    }

    /// Copy of the environment additions for a child process
    pub fn overlay(&self) -> EnvOverlay {
        let mut vars = HashMap::with_capacity(1);
        vars.insert(self.secret_env.to_string(), self.secret.clone());
        EnvOverlay { vars }
    }

    /// Add the secret variable to a command's environment
    pub fn apply(&self, command: &mut Command) {
        command.env(self.secret_env, self.secret.as_str());
    }

    /// Build a command that runs `argv` as root through the wrapper
    pub fn command<I, S>(&self, argv: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(self.wrapper);
        command.args(argv);
        self.apply(&mut command);
        command
    }
}

impl fmt::Debug for Escalation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalation")
            .field("wrapper", &self.wrapper)
            .field("secret_env", &self.secret_env)
            .finish_non_exhaustive()
    }
}

/// Environment additions carrying the secret. Never logged.
#[derive(Clone)]
pub struct EnvOverlay {
    vars: HashMap<String, Zeroizing<String>>,
}

impl EnvOverlay {
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for EnvOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.vars.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// Wrapper body: pipe the secret from the environment into `sudo -S -k`.
///
/// `-k` makes every call read the password from the pipe and never cache a
/// ticket, so the secret can never become the escalated command's stdin.
fn wrapper_script(program: &Path, secret_env: &str) -> String {
    let program = shell_escape::escape(program.to_string_lossy());
    format!(
        "#!/bin/sh\n\
         # Generated by dvr-installer; removed when the session ends.\n\
         printf '%s\\n' \"${secret_env}\" | {program} -S -k -p '' -- \"$@\"\n"
    )
}

fn write_wrapper(dir: &Path, script: &str) -> io::Result<TempPath> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir)?;

    // tempfile creates the file 0600, so it is never group/world readable
    let mut file = tempfile::Builder::new()
        .prefix("dvr-escalate-")
        .suffix(".sh")
        .tempfile_in(dir)?;
    file.write_all(script.as_bytes())?;
    file.as_file().sync_all()?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o700))?;

    // closing the handle avoids ETXTBSY when the wrapper is executed
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;

    fn is_owner_only(path: &Path) -> bool {
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        mode & 0o077 == 0
    }

    fn broker(dir: &tempfile::TempDir) -> CredentialBroker {
        CredentialBroker::new(testing::escalation_config(dir.path()))
    }

    #[tokio::test]
    #[serial]
    async fn test_begin_session_creates_private_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);

        broker.begin_session(testing::password()).await.unwrap();
        assert!(broker.is_active());

        let wrapper = broker.escalation_capability().unwrap().wrapper_path().to_path_buf();
        let mode = std::fs::metadata(&wrapper).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(is_owner_only(&wrapper));

        let script = std::fs::read_to_string(&wrapper).unwrap();
        assert!(!script.contains(testing::PASSWORD));

        broker.end_session();
        assert!(!wrapper.exists());
        assert!(!broker.is_active());
    }

    #[tokio::test]
    #[serial]
    async fn test_wrong_password_leaves_session_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);

        let result = broker.begin_session(Zeroizing::new("wrong".to_string())).await;
        assert!(matches!(result, Err(AuthError::Rejected)));
        assert!(!broker.is_active());
        assert!(matches!(
            broker.escalation_capability(),
            Err(AuthError::NoActiveSession)
        ));
        assert_eq!(testing::wrappers_in(&dir.path().join("run")), 0);

        // second attempt with the right password succeeds
        broker.begin_session(testing::password()).await.unwrap();
        assert_eq!(testing::wrappers_in(&dir.path().join("run")), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_empty_password_rejected_without_running_sudo() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);

        let result = broker.begin_session(Zeroizing::new(String::new())).await;
        assert!(matches!(result, Err(AuthError::EmptyPassword)));
    }

    #[tokio::test]
    #[serial]
    async fn test_single_session_per_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = broker(&dir);
        let mut second = broker(&dir);

        first.begin_session(testing::password()).await.unwrap();

        assert!(matches!(
            first.begin_session(testing::password()).await,
            Err(AuthError::AlreadyActive)
        ));
        assert!(matches!(
            second.begin_session(testing::password()).await,
            Err(AuthError::AlreadyActive)
        ));

        first.end_session();
        second.begin_session(testing::password()).await.unwrap();
        assert!(second.is_active());
    }

    #[tokio::test]
    #[serial]
    async fn test_end_session_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);

        broker.end_session();
        broker.begin_session(testing::password()).await.unwrap();

        // wrapper removed behind our back
        let wrapper = broker.escalation_capability().unwrap().wrapper_path().to_path_buf();
        std::fs::remove_file(&wrapper).unwrap();

        broker.end_session();
        broker.end_session();
        assert!(!broker.is_active());
    }

    #[tokio::test]
    #[serial]
    async fn test_overlay_holds_only_the_secret() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);
        assert!(matches!(
            broker.environment_overlay(),
            Err(AuthError::NoActiveSession)
        ));

        broker.begin_session(testing::password()).await.unwrap();
        let overlay = broker.environment_overlay().unwrap();

        assert_eq!(overlay.len(), 1);
        assert!(overlay.contains_key(testing::SECRET_ENV));
        assert!(!format!("{:?}", overlay).contains(testing::PASSWORD));
        assert!(!format!("{:?}", broker.escalation_capability().unwrap())
            .contains(testing::PASSWORD));
    }

    #[tokio::test]
    #[serial]
    async fn test_escalated_command_runs_through_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);
        broker.begin_session(testing::password()).await.unwrap();

        let escalation = broker.escalation_capability().unwrap();
        let status = escalation.command(["sh", "-c", "exit 0"]).status().await.unwrap();
        assert!(status.success());

        let status = escalation.command(["sh", "-c", "exit 4"]).status().await.unwrap();
        assert_eq!(status.code(), Some(4));
    }

    #[tokio::test]
    #[serial]
    async fn test_drop_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = {
            let mut broker = broker(&dir);
            broker.begin_session(testing::password()).await.unwrap();
            broker.escalation_capability().unwrap().wrapper_path().to_path_buf()
        };

        assert!(!wrapper.exists());
        let mut again = broker(&dir);
        again.begin_session(testing::password()).await.unwrap();
    }

    #[test]
    fn test_wrapper_script_quotes_program() {
        let script = wrapper_script(Path::new("/opt/my sudo"), "SECRET");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("'/opt/my sudo' -S -k -p ''"));
        assert!(script.contains("\"$SECRET\""));
    }

    #[tokio::test]
    #[serial]
    async fn test_wrapper_never_hands_secret_to_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);
        broker.begin_session(testing::password()).await.unwrap();
        let escalation = broker.escalation_capability().unwrap();

        // a second call must not find a cached ticket and pass the pipe on
        for _ in 0..2 {
            let output = escalation.command(["cat"]).output().await.unwrap();
            assert!(output.status.success());
            assert!(!String::from_utf8_lossy(&output.stdout).contains(testing::PASSWORD));
        }
        assert!(!testing::ticket(dir.path()).exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_end_session_clears_sudo_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = broker(&dir);
        broker.begin_session(testing::password()).await.unwrap();

        // e.g. cached by a command run outside the wrapper
        std::fs::write(testing::ticket(dir.path()), "").unwrap();

        broker.end_session();
        assert!(!testing::ticket(dir.path()).exists());
    }
}
