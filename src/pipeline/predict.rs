use crate::config::schema::PredictionConfig;
use crate::error::{LungsegError, Result};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

/// Output lines kept for the error message when nnUNet fails
const TAIL_LINES: usize = 20;

/// One prediction over a staged case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionRequest {
    pub staging_dir: PathBuf,
    /// Trained model folder (the one holding `dataset.json`)
    pub model_folder: PathBuf,
    pub fold: String,
    pub output_dir: PathBuf,
}

/// Something that turns a staging folder into a segmentation
///
/// The contract: on success exactly one result for case `001` has been
/// written into `output_dir`.
pub trait Predictor {
    fn predict(&self, request: &PredictionRequest) -> Result<()>;
}

impl<T: Predictor + ?Sized> Predictor for &T {
    fn predict(&self, request: &PredictionRequest) -> Result<()> {
        (**self).predict(request)
    }
}

impl<T: Predictor + ?Sized> Predictor for Box<T> {
    fn predict(&self, request: &PredictionRequest) -> Result<()> {
        (**self).predict(request)
    }
}

/// Runs `nnUNetv2_predict_from_modelfolder` as a child process
#[derive(Debug, Clone)]
pub struct NnUnetCli {
    executable: PathBuf,
    device: String,
    step_size: f32,
    disable_tta: bool,
    preprocessing_workers: u32,
    export_workers: u32,
}

impl NnUnetCli {
    /// Locate the nnUNet executable named in the config
    ///
    /// # Errors
    /// Returns a prediction error when the executable is not on `PATH`
    pub fn new(config: &PredictionConfig) -> Result<Self> {
        let executable = which::which(&config.executable).map_err(|_| {
            LungsegError::Prediction(format!(
                "'{}' not found in PATH. Install nnUNetv2 with: pip install nnunetv2",
                config.executable
            ))
        })?;
        tracing::debug!("Using nnUNet at {}", executable.display());

        Ok(Self {
            executable,
            device: config.device.clone(),
            step_size: config.step_size,
            disable_tta: config.disable_tta,
            preprocessing_workers: config.preprocessing_workers,
            export_workers: config.export_workers,
        })
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Command line arguments for one request
    #[must_use]
    pub fn args(&self, request: &PredictionRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            request.staging_dir.clone().into(),
            "-o".into(),
            request.output_dir.clone().into(),
            "-m".into(),
            request.model_folder.clone().into(),
            "-f".into(),
            request.fold.clone().into(),
            "-device".into(),
            self.device.clone().into(),
            "-step_size".into(),
            self.step_size.to_string().into(),
            "-npp".into(),
            self.preprocessing_workers.to_string().into(),
            "-nps".into(),
            self.export_workers.to_string().into(),
        ];
        if self.disable_tta {
            args.push("--disable_tta".into());
        }
        args
    }
}

impl Predictor for NnUnetCli {
    fn predict(&self, request: &PredictionRequest) -> Result<()> {
        let args = self.args(request);
        tracing::info!(
            "Running {} on {} (fold {}, device {})",
            self.executable.display(),
            request.staging_dir.display(),
            request.fold,
            self.device
        );
        tracing::debug!("nnUNet arguments: {args:?}");

        let mut child = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                LungsegError::Prediction(format!(
                    "Failed to start {}: {e}",
                    self.executable.display()
                ))
            })?;

        let tail = Mutex::new(VecDeque::with_capacity(TAIL_LINES));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        std::thread::scope(|scope| {
            if let Some(err) = stderr {
                let tail = &tail;
                scope.spawn(move || stream_lines(err, tail));
            }
            if let Some(out) = stdout {
                stream_lines(out, &tail);
            }
        });

        let status = child.wait().map_err(|e| {
            LungsegError::Prediction(format!("Failed to wait for nnUNet: {e}"))
        })?;
        if status.success() {
            return Ok(());
        }

        let output = tail
            .into_inner()
            .map(|lines| Vec::from(lines).join("\n"))
            .unwrap_or_default();
        Err(LungsegError::Prediction(format!(
            "nnUNet exited with {status}:\n{output}"
        )))
    }
}

/// Log every line of `reader` and keep the last few in `tail`
///
/// Reads until EOF no matter what: a child writing into a closed pipe
/// dies of SIGPIPE.
fn stream_lines(reader: impl Read, tail: &Mutex<VecDeque<String>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Lost nnUNet output: {e}");
                if let Err(e) = io::copy(&mut reader, &mut io::sink()) {
                    tracing::debug!("Draining nnUNet output failed: {e}");
                }
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        tracing::info!(target: "nnunet", "{line}");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PredictionRequest {
        PredictionRequest {
            staging_dir: PathBuf::from("/tmp/run/staging"),
            model_folder: PathBuf::from("/models/Dataset101/trainer"),
            fold: "0".to_string(),
            output_dir: PathBuf::from("prediction"),
        }
    }

    fn cli(disable_tta: bool) -> NnUnetCli {
        NnUnetCli {
            executable: PathBuf::from("/usr/bin/nnUNetv2_predict_from_modelfolder"),
            device: "cpu".to_string(),
            step_size: 0.5,
            disable_tta,
            preprocessing_workers: 3,
            export_workers: 2,
        }
    }

    #[test]
    fn test_args_layout() {
        let args: Vec<String> = cli(false)
            .args(&request())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-i",
                "/tmp/run/staging",
                "-o",
                "prediction",
                "-m",
                "/models/Dataset101/trainer",
                "-f",
                "0",
                "-device",
                "cpu",
                "-step_size",
                "0.5",
                "-npp",
                "3",
                "-nps",
                "2",
            ]
        );
    }

    #[test]
    fn test_disable_tta_flag() {
        let args = cli(true).args(&request());
        assert_eq!(
            args.last().map(OsString::as_os_str),
            Some(std::ffi::OsStr::new("--disable_tta"))
        );
    }

    #[test]
    fn test_missing_executable() {
        let config = PredictionConfig {
            executable: "lungseg-no-such-nnunet-binary".to_string(),
            ..PredictionConfig::default()
        };
        let err = NnUnetCli::new(&config).unwrap_err();
        assert!(matches!(err, LungsegError::Prediction(_)));
        assert!(err.to_string().contains("not found in PATH"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_carries_output_tail() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-nnunet");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'starting'\necho 'RuntimeError: CUDA out of memory' >&2\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut nnunet = cli(false);
        nnunet.executable = script;
        let err = nnunet.predict(&request()).unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, LungsegError::Prediction(_)));
        assert!(message.contains("CUDA out of memory"), "{message}");
        assert!(message.contains("starting"), "{message}");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_output_is_drained() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-nnunet");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'caf\\351\\n'\ni=0\nwhile [ $i -lt 20000 ]; do echo \"line $i\"; i=$((i+1)); done\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut nnunet = cli(false);
        nnunet.executable = script;
        assert!(nnunet.predict(&request()).is_ok());
    }

    #[test]
    fn test_stream_lines_keeps_lossy_tail() {
        let tail = Mutex::new(VecDeque::new());
        let output: Vec<u8> = b"caf\xe9\r\n"
            .iter()
            .copied()
            .chain((0..30).flat_map(|i| format!("step {i}\n").into_bytes()))
            .chain(b"done".iter().copied())
            .collect();

        stream_lines(output.as_slice(), &tail);

        let tail = tail.into_inner().unwrap();
        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail.back().map(String::as_str), Some("done"));
        assert_eq!(tail.front().map(String::as_str), Some("step 11"));

        let short = Mutex::new(VecDeque::new());
        stream_lines(&b"caf\xe9\r\nok\n"[..], &short);
        let short = short.into_inner().unwrap();
        assert_eq!(short, ["caf\u{fffd}", "ok"]);
    }
}
