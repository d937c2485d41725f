use crate::utils::errors::{RecordError, Result};
use log::info;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Runs `argv` and copies its stdout and stderr, merged line by line, into
/// `sink` as they are produced. Bytes pass through unchanged. Lines of one
/// stream keep their order; the two streams interleave in arrival order.
pub async fn run_task<W>(argv: &[String], sink: &mut W) -> Result<ExitStatus>
where
    W: AsyncWrite + Unpin,
{
    let command_line = argv.join(" ");
    let (program, args) = argv.split_first().ok_or(RecordError::EmptyTask)?;
    let failure = |reason: String| RecordError::TaskFailure {
        command: command_line.clone(),
        reason,
    };

    info!("Running task: {}", command_line);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failure(format!("cannot start: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| failure("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| failure("stderr not captured".to_string()))?;
    let mut out_reader = BufReader::new(stdout);
    let mut err_reader = BufReader::new(stderr);
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let (mut out_open, mut err_open) = (true, true);

    // read_until keeps partially read bytes in the buffer when the other
    // branch wins, so each buffer is only drained once a read completes.
    while out_open || err_open {
        tokio::select! {
            read = out_reader.read_until(b'\n', &mut out_buf), if out_open => {
                out_open = forward(sink, read, &mut out_buf, "<task stdout>").await?;
            }
            read = err_reader.read_until(b'\n', &mut err_buf), if err_open => {
                err_open = forward(sink, read, &mut err_buf, "<task stderr>").await?;
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| failure(format!("cannot wait for exit: {}", e)))?;
    if !status.success() {
        return Err(failure(describe(status)));
    }
    Ok(status)
}

/// Copies one completed read into `sink` byte for byte. Returns whether the
/// stream is still open.
async fn forward<W: AsyncWrite + Unpin>(
    sink: &mut W,
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    stream: &str,
) -> Result<bool> {
    let read = read.map_err(|e| RecordError::io(stream, e))?;
    if !buf.is_empty() {
        sink.write_all(buf).await.map_err(|e| RecordError::io("<stdout>", e))?;
        sink.flush().await.map_err(|e| RecordError::io("<stdout>", e))?;
        buf.clear();
    }
    Ok(read > 0)
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn test_streams_both_outputs() {
        let mut sink: Vec<u8> = Vec::new();
        let status = run_task(&argv(&["sh", "-c", "echo one; echo two >&2; echo three"]), &mut sink)
            .await
            .unwrap();
        assert!(status.success());

        let output = String::from_utf8(sink).unwrap();
        let mut lines: Vec<&str> = output.lines().collect();
        // order within stdout is kept
        let one = lines.iter().position(|l| *l == "one").unwrap();
        let three = lines.iter().position(|l| *l == "three").unwrap();
        assert!(one < three);
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_task_failure() {
        let mut sink: Vec<u8> = Vec::new();
        match run_task(&argv(&["sh", "-c", "echo partial; exit 3"]), &mut sink).await {
            Err(RecordError::TaskFailure { command, reason }) => {
                assert_eq!(command, "sh -c echo partial; exit 3");
                assert_eq!(reason, "exit status 3");
            }
            other => panic!("Expected TaskFailure, got {:?}", other),
        }
        assert_eq!(String::from_utf8(sink).unwrap(), "partial\n");
    }

    #[tokio::test]
    async fn test_invalid_utf8_passes_through() {
        let mut sink: Vec<u8> = Vec::new();
        run_task(&argv(&["sh", "-c", "printf 'a\\n\\377\\nb\\nc\\n'"]), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink, b"a\n\xff\nb\nc\n".to_vec());
    }

    #[tokio::test]
    async fn test_binary_output_does_not_stall_the_task() {
        let mut sink: Vec<u8> = Vec::new();
        let script = "printf '\\377\\n'; head -c 200000 /dev/zero | tr '\\0' x";
        let args = argv(&["sh", "-c", script]);
        let run = run_task(&args, &mut sink);
        let status = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("task stalled")
            .unwrap();
        assert!(status.success());
        assert_eq!(sink.len(), 2 + 200_000);
        assert_eq!(&sink[..2], b"\xff\n");
        assert!(sink[2..].iter().all(|b| *b == b'x'));
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_kept() {
        let mut sink: Vec<u8> = Vec::new();
        run_task(&argv(&["sh", "-c", "printf 'tail'"]), &mut sink).await.unwrap();
        assert_eq!(sink, b"tail".to_vec());
    }

    #[tokio::test]
    async fn test_missing_program_is_task_failure() {
        let mut sink: Vec<u8> = Vec::new();
        let result = run_task(&argv(&["/definitely/not/a/program"]), &mut sink).await;
        assert!(matches!(result, Err(RecordError::TaskFailure { .. })));
    }

    #[tokio::test]
    async fn test_empty_argv() {
        let mut sink: Vec<u8> = Vec::new();
        assert!(matches!(run_task(&[], &mut sink).await, Err(RecordError::EmptyTask)));
    }
}
