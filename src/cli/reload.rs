//! `reload` subcommand
//!
//! Sends SIGHUP to the PID recorded by a running `botlockbox serve`,
//! triggering a live secret reload in that process.

use anyhow::{Context, Result};

use super::ReloadArgs;

#[cfg(unix)]
pub fn run(args: ReloadArgs) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let data = std::fs::read_to_string(&args.pidfile)
        .with_context(|| format!("reading PID file {}", args.pidfile.display()))?;
    let pid: i32 = data
        .trim()
        .parse()
        .with_context(|| format!("invalid PID in file {}: {:?}", args.pidfile.display(), data.trim()))?;

    kill(Pid::from_raw(pid), Signal::SIGHUP)
        .with_context(|| format!("sending SIGHUP to PID {pid}"))?;

    println!("SIGHUP sent to PID {pid}");
    Ok(())
}

#[cfg(not(unix))]
pub fn run(_args: ReloadArgs) -> Result<()> {
    anyhow::bail!("reload requires a Unix platform")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_pidfile_errors() {
        let args = ReloadArgs {
            pidfile: PathBuf::from("/nonexistent/botlockbox.pid"),
        };
        assert!(run(args).is_err());
    }

    #[test]
    fn test_garbage_pid_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botlockbox.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();

        let err = run(ReloadArgs { pidfile: path }).unwrap_err();
        assert!(err.to_string().contains("invalid PID"));
    }

    #[test]
    fn test_sighup_self_is_harmless_when_ignored() {
        // SIGHUP default disposition would kill us, so block it first.
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGHUP, &ignore) }.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botlockbox.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        run(ReloadArgs { pidfile: path }).unwrap();
    }
}
