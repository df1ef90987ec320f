//! OpenPGP clear-signing and verification.
//!
//! The tree engine only sees the [`OpenPgpEnvironment`] trait. [`GnuPg`]
//! implements it by running `gpg` and reading its machine-readable status
//! output.

use chrono::{DateTime, Utc};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub fingerprint: String,
    pub primary_key_fingerprint: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub expire_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenPgpError {
    #[error("OpenPGP verification failed: {0}")]
    VerificationFailed(String),
    #[error("OpenPGP signing failed: {0}")]
    SigningFailed(String),
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait OpenPgpEnvironment {
    /// Verifies a complete clear-signed message.
    fn verify_clearsigned(&self, message: &[u8]) -> Result<SignatureInfo, OpenPgpError>;

    /// Wraps `data` in a clear-signed message, optionally using a specific key.
    fn clear_sign(&self, data: &[u8], keyid: Option<&str>) -> Result<Vec<u8>, OpenPgpError>;
}

#[derive(Debug, Clone)]
pub struct GnuPg {
    pub program: String,
    pub homedir: Option<PathBuf>,
}

impl Default for GnuPg {
    fn default() -> Self {
        GnuPg {
            program: "gpg".to_string(),
            homedir: None,
        }
    }
}

struct GpgOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl GnuPg {
    fn run(&self, args: &[&str], input: &[u8]) -> Result<GpgOutput, OpenPgpError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--batch");
        if let Some(homedir) = &self.homedir {
            cmd.arg("--homedir").arg(homedir);
        }
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Running {} {:?}", self.program, args);
        let spawn_error = |source| OpenPgpError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;

        let stdin = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            // Feed stdin from a separate thread so a large message cannot
            // deadlock against gpg filling its output pipes.
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(input),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (output, written)
        });
        let output = output.map_err(spawn_error)?;

        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if let Err(e) = written {
            warn!("Failed to write input to {}: {}", self.program, e);
            if !stderr.trim().is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("error writing input to {}: {}", self.program, e));
        }

        Ok(GpgOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr,
        })
    }
}

impl OpenPgpEnvironment for GnuPg {
    fn verify_clearsigned(&self, message: &[u8]) -> Result<SignatureInfo, OpenPgpError> {
        let output = self.run(&["--status-fd", "1", "--verify"], message)?;
        let status = String::from_utf8_lossy(&output.stdout);
        let info = parse_status_output(&status)?;
        if !output.success {
            return Err(OpenPgpError::VerificationFailed(output.stderr.trim().to_string()));
        }
        Ok(info)
    }

    fn clear_sign(&self, data: &[u8], keyid: Option<&str>) -> Result<Vec<u8>, OpenPgpError> {
        let mut args = vec!["--clearsign"];
        if let Some(keyid) = keyid {
            args.extend(["--local-user", keyid]);
        }
        let output = self.run(&args, data)?;
        if !output.success {
            return Err(OpenPgpError::SigningFailed(output.stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }
}

fn parse_gpg_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match value.parse::<i64>() {
        Ok(0) => None,
        Ok(secs) => DateTime::from_timestamp(secs, 0),
        Err(_) => chrono::NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
            .ok()
            .map(|ts| ts.and_utc()),
    }
}

/// Extracts the signature details from `gpg --status-fd` output.
pub fn parse_status_output(status: &str) -> Result<SignatureInfo, OpenPgpError> {
    let mut info = None;
    for line in status.lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        match fields.first().copied() {
            Some("VALIDSIG") => {
                let args = &fields[1..];
                if args.len() < 10 {
                    return Err(OpenPgpError::VerificationFailed(format!(
                        "malformed VALIDSIG line: {line}"
                    )));
                }
                info = Some(SignatureInfo {
                    fingerprint: args[0].to_string(),
                    primary_key_fingerprint: args[9].to_string(),
                    timestamp: parse_gpg_timestamp(args[2]),
                    expire_timestamp: parse_gpg_timestamp(args[3]),
                });
            }
            Some(code @ ("BADSIG" | "EXPSIG" | "EXPKEYSIG" | "REVKEYSIG" | "ERRSIG")) => {
                return Err(OpenPgpError::VerificationFailed(format!(
                    "gpg reported {code}"
                )));
            }
            _ => {}
        }
    }
    info.ok_or_else(|| OpenPgpError::VerificationFailed("no valid signature found".to_string()))
}
