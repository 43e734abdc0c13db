use super::{SourceKind, SourceUnavailable};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_STEP: Duration = Duration::from_millis(10);

/// Runs an external probe and returns its stdout, killing the child once
/// `timeout` elapses so one hung driver tool cannot stall the tick loop.
pub fn run_bounded(
    kind: SourceKind,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, SourceUnavailable> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| SourceUnavailable::new(kind, format!("{program}: {err}")))?;

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(SourceUnavailable::new(kind, format!("{program}: no stdout")));
    };
    let reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(SourceUnavailable::new(
                    kind,
                    format!("{program}: timed out after {}ms", timeout.as_millis()),
                ));
            }
            Ok(None) => thread::sleep(POLL_STEP),
            Err(err) => {
                let _ = child.kill();
                return Err(SourceUnavailable::new(kind, format!("{program}: {err}")));
            }
        }
    };

    let bytes = reader.join().unwrap_or_default();
    if !status.success() {
        return Err(SourceUnavailable::new(
            kind,
            format!("{program}: exited with {status}"),
        ));
    }

    Ok(decode_cmd_stdout(&bytes))
}

/// Windows tools may emit UTF-16LE; everything else is UTF-8.
pub fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}
