//! Execution wrapper for invoking `cryptsetup`.
//!
//! Secrets reach the child only through stdin (`--key-file -`). Every call
//! runs a writer thread that streams the payload and closes the pipe, reader
//! threads that drain stdout/stderr, and a deadline on the child itself. All
//! helper threads are joined before a call returns.

use awskmsluks_core::error::{KmsLuksError, KmsLuksResult};
use log::debug;
use std::ffi::OsStr;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Literal answer to the `luksUUID` confirmation prompt.
const CONFIRMATION_TOKEN: &[u8] = b"YES\n";

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

/// Where child output is copied while it runs, in addition to being captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    Quiet,
    Live,
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    pub(crate) fn format(&self, device: &Path, passphrase: &[u8]) -> KmsLuksResult<()> {
        let args = [
            OsStr::new("luksFormat"),
            OsStr::new("--batch-mode"),
            OsStr::new("--key-file"),
            OsStr::new("-"),
            device.as_os_str(),
        ];
        let out = self.run(&args, Some(passphrase), Echo::Live)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let message = classify_format_failure(device, &diagnostic);
        Err(KmsLuksError::Tool(format!(
            "{message} (exit code {})",
            out.status
        )))
    }

    pub(crate) fn set_uuid(&self, device: &Path, uuid: &str) -> KmsLuksResult<()> {
        let args = [
            OsStr::new("luksUUID"),
            OsStr::new("--uuid"),
            OsStr::new(uuid),
            device.as_os_str(),
        ];
        let out = self.run(&args, Some(CONFIRMATION_TOKEN), Echo::Quiet)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let message = classify_uuid_failure(device, uuid, &diagnostic);
        Err(KmsLuksError::Tool(format!(
            "{message} (exit code {})",
            out.status
        )))
    }

    pub(crate) fn open(&self, device: &Path, name: &str, passphrase: &[u8]) -> KmsLuksResult<()> {
        if dev_mapper_node_exists(name) {
            debug!("/dev/mapper/{name} already present; skipping open");
            return Ok(());
        }

        let primary_args = [
            OsStr::new("open"),
            OsStr::new("--type"),
            OsStr::new("luks"),
            OsStr::new("--key-file"),
            OsStr::new("-"),
            device.as_os_str(),
            OsStr::new(name),
        ];
        let mut out = self.run(&primary_args, Some(passphrase), Echo::Live)?;

        if out.status != 0 && action_unsupported(&out) {
            let fallback_args = [
                OsStr::new("luksOpen"),
                OsStr::new("--key-file"),
                OsStr::new("-"),
                device.as_os_str(),
                OsStr::new(name),
            ];
            out = self.run(&fallback_args, Some(passphrase), Echo::Live)?;
        }

        if out.status == 0 || dev_mapper_node_exists(name) {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let message = classify_open_failure(name, device, &diagnostic);
        Err(KmsLuksError::Tool(format!(
            "{message} (exit code {})",
            out.status
        )))
    }

    fn run(&self, args: &[&OsStr], input: Option<&[u8]>, echo: Echo) -> KmsLuksResult<Output> {
        debug!(
            "running {} {}",
            self.binary.display(),
            args.first()
                .map(|action| action.to_string_lossy())
                .unwrap_or_default()
        );

        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            KmsLuksError::Tool(format!("failed to spawn {}: {err}", self.binary.display()))
        })?;

        let writer = match (input, child.stdin.take()) {
            (Some(payload), Some(stdin)) => Some(spawn_input_writer(
                stdin,
                Zeroizing::new(payload.to_vec()),
            )),
            _ => None,
        };
        let stdout_handle = spawn_output_reader(child.stdout.take(), echo, io::stdout);
        let stderr_handle = spawn_output_reader(child.stderr.take(), echo, io::stderr);

        let waited = self.wait_with_timeout(&mut child);

        let written = writer.map(|handle| join_helper(handle, "stdin writer"));
        let stdout = join_helper(stdout_handle, "stdout reader");
        let stderr = join_helper(stderr_handle, "stderr reader");

        let status = waited?;
        if let Some(written) = written {
            written?;
        }

        Ok(Output {
            stdout: stdout?,
            stderr: stderr?,
            status,
        })
    }

    fn wait_with_timeout(&self, child: &mut Child) -> KmsLuksResult<i32> {
        let start = Instant::now();
        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                return Ok(status.code().unwrap_or(-1));
            }
            thread::sleep(Duration::from_millis(25));
        }

        let _ = child.kill();
        let _ = child.wait();
        Err(KmsLuksError::Tool(format!(
            "{} timed out after {:?}",
            self.binary.display(),
            self.timeout
        )))
    }
}

/// Stream `payload` into the child's stdin, then close it to signal end of input.
///
/// A child that exits without reading everything closes its end first; that
/// broken pipe is not an error here because the exit status already tells
/// the story. `payload` is zeroed when the thread finishes.
fn spawn_input_writer(stdin: ChildStdin, payload: Zeroizing<Vec<u8>>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut stdin = stdin;
        let result = stdin.write_all(&payload).and_then(|()| stdin.flush());
        drop(stdin);
        match result {
            Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    })
}

fn spawn_output_reader<R, W, F>(pipe: Option<R>, echo: Echo, sink: F) -> JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
    W: Write,
    F: Fn() -> W + Send + 'static,
{
    thread::spawn(move || {
        let Some(mut reader) = pipe else {
            return Ok(String::new());
        };

        let mut captured = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            captured.extend_from_slice(&chunk[..read]);
            if echo == Echo::Live {
                let mut out = sink();
                let _ = out.write_all(&chunk[..read]);
                let _ = out.flush();
            }
        }
        Ok(String::from_utf8_lossy(&captured).into_owned())
    })
}

fn join_helper<T>(handle: JoinHandle<io::Result<T>>, role: &str) -> KmsLuksResult<T> {
    handle
        .join()
        .map_err(|_| KmsLuksError::Tool(format!("{role} thread panicked")))?
        .map_err(KmsLuksError::Io)
}

fn dev_mapper_node_exists(name: &str) -> bool {
    let root = Path::new("/dev/mapper");
    root.is_dir() && root.join(name).exists()
}

fn action_unsupported(output: &Output) -> bool {
    let diagnostic = output_diagnostic(output);
    let diagnostic_lower = diagnostic.to_ascii_lowercase();
    diagnostic_lower.contains("unknown action")
        || diagnostic_lower.contains("unknown command")
        || diagnostic_lower.contains("invalid action")
        || diagnostic_lower.contains("invalid command")
        || diagnostic_lower.contains("unknown option")
}

fn normalise_diagnostic(diagnostic: &str) -> (String, String) {
    let trimmed = diagnostic.trim();
    let lower = trimmed.to_ascii_lowercase();
    let diagnostic = if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    };
    (diagnostic, lower)
}

fn mentions_privilege(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
        || lower.contains("must be run as root")
}

fn mentions_missing_device(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

fn classify_format_failure(device: &Path, diagnostic: &str) -> String {
    let device = device.display();
    let (diagnostic, lower) = normalise_diagnostic(diagnostic);

    if mentions_privilege(&lower) {
        return format!(
            "cryptsetup could not format `{device}`: {diagnostic}. This requires elevated privileges (run as root)"
        );
    }

    if lower.contains("in use") || lower.contains("busy") || lower.contains("exclusive") {
        return format!(
            "cryptsetup could not format `{device}` because it is in use: {diagnostic}. Unmount it and close any mappings first"
        );
    }

    if mentions_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{device}`: {diagnostic}. Confirm the device path is correct and present"
        );
    }

    format!("cryptsetup failed to format `{device}`: {diagnostic}")
}

fn classify_uuid_failure(device: &Path, uuid: &str, diagnostic: &str) -> String {
    let device = device.display();
    let (diagnostic, lower) = normalise_diagnostic(diagnostic);

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!(
            "cryptsetup refused to set UUID {uuid} because `{device}` is not a LUKS device: {diagnostic}"
        );
    }

    if lower.contains("invalid uuid") || lower.contains("wrong luks uuid format") {
        return format!("cryptsetup rejected UUID {uuid} for `{device}`: {diagnostic}");
    }

    if mentions_privilege(&lower) {
        return format!(
            "cryptsetup could not set UUID {uuid} on `{device}`: {diagnostic}. This requires elevated privileges (run as root)"
        );
    }

    format!("cryptsetup failed to set UUID {uuid} on `{device}`: {diagnostic}")
}

fn classify_open_failure(name: &str, device: &Path, diagnostic: &str) -> String {
    let device = device.display();
    let (diagnostic, lower) = normalise_diagnostic(diagnostic);

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!(
            "cryptsetup rejected the passphrase for `{device}` (mapping `{name}`): {diagnostic}. The device may have been formatted with a different key"
        );
    }

    if mentions_privilege(&lower) {
        return format!(
            "cryptsetup could not open `{device}` as `{name}`: {diagnostic}. This requires elevated privileges (run as root)"
        );
    }

    if mentions_missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{device}` for mapping `{name}`: {diagnostic}. Confirm the device is attached"
        );
    }

    format!("cryptsetup failed to open `{device}` as `{name}`: {diagnostic}")
}

fn output_diagnostic(output: &Output) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else {
        stdout.to_string()
    }
}
