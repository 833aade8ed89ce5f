//! Child-process helpers shared across the workspace.
//!
//! Handlers that shell out to external programs go through these builders so
//! every child is configured the same way: piped stdio, killed when its handle
//! is dropped, and no console window on Windows.

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Build a `tokio::process::Command` that runs `script` through the platform shell.
///
/// stdin, stdout and stderr are all piped, and the child is killed if the
/// returned command's child handle is dropped before it exits.
#[cfg(feature = "tokio")]
pub fn shell_command(script: &str) -> tokio::process::Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut c = tokio::process::Command::new("cmd");
        c.args(["/C", script]);
        c
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut c = tokio::process::Command::new("sh");
        c.args(["-c", script]);
        c
    };

    piped(&mut cmd);
    cmd
}

#[cfg(feature = "tokio")]
fn piped(cmd: &mut tokio::process::Command) {
    use std::process::Stdio;

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.no_window();
}
