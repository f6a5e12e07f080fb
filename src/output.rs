use log::{info, warn};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines},
    process::{ChildStderr, ChildStdout},
};

/// Forwards stdout and stderr of a child to the log, one line at a time in
/// arrival order, until both streams are closed.
pub async fn forward_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    target: &'static str,
    label: &str,
) {
    let mut stdout = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr = stderr.map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            line = next_line(&mut stdout, label), if stdout.is_some() => match line {
                Some(line) => info!(target: target, "[{}] {}", label, line),
                None => stdout = None,
            },
            line = next_line(&mut stderr, label), if stderr.is_some() => match line {
                Some(line) => info!(target: target, "[{}] {}", label, line),
                None => stderr = None,
            },
            else => break,
        }
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>, label: &str) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let lines = lines.as_mut()?;
    match lines.next_line().await {
        Ok(line) => line,
        Err(error) => {
            warn!("Error reading output of {}: {}", label, error);
            None
        }
    }
}
