//! Thin wrappers around one-shot `adb` invocations.

use std::process::Output;

use tokio::process::Command;

/// Run `adb -s <serial> <args..>` to completion, capturing its output.
pub(crate) async fn run_adb(serial: &str, args: &[&str]) -> std::io::Result<Output> {
	Command::new("adb").arg("-s").arg(serial).args(args).output().await
}

/// Run an adb command and fail with its trimmed stderr on a non-zero exit.
pub(crate) async fn run_adb_checked(serial: &str, args: &[&str]) -> Result<String, String> {
	match run_adb(serial, args).await {
		Ok(output) if output.status.success() => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
		Ok(output) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
		Err(err) => Err(err.to_string()),
	}
}

/// Read a single system property from the device.
pub(crate) async fn getprop(serial: &str, prop: &str) -> Result<String, String> {
	run_adb_checked(serial, &["shell", "getprop", prop]).await
}
