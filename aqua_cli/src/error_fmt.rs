//! Human-readable error descriptions and structured JSON error formatting.

use aqua_core::error::{AquaError, DatasetError};

/// Stable short name for the error class, used in JSON output.
fn reason_name(err: &eyre::Report) -> &'static str {
    if err.downcast_ref::<DatasetError>().is_some() {
        return "Dataset";
    }
    match err.downcast_ref::<AquaError>() {
        Some(AquaError::Config(_)) => "Config",
        Some(AquaError::Device(_)) => "Device",
        Some(AquaError::Timeout(_)) => "Timeout",
        Some(AquaError::Dataset(_)) => "Dataset",
        Some(AquaError::Predictor(_)) => "Predictor",
        Some(AquaError::Io(_)) => "Io",
        None => "Error",
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(de) = err.downcast_ref::<DatasetError>() {
        return match de {
            DatasetError::Duplicate(t) => format!(
                "What happened: An episode closing at {t} is already stored.\nLikely causes: The same export was imported twice.\nHow to fix: Nothing to do; duplicates are skipped on import."
            ),
            DatasetError::Corrupt(msg) => format!(
                "What happened: The dataset file could not be parsed ({msg}).\nLikely causes: The file was edited by hand or truncated by a crash outside the controller.\nHow to fix: Restore it from a backup or move it aside to start an empty dataset."
            ),
            DatasetError::UnsupportedVersion { found, supported } => format!(
                "What happened: The dataset was written by a newer release (schema {found}, this build reads up to {supported}).\nHow to fix: Upgrade the controller or point [dataset] at another file."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: Missing directory or insufficient permissions.\nHow to fix: Check [dataset] dir and file in the config."
            ),
        };
    }

    if let Some(ae) = err.downcast_ref::<AquaError>() {
        return match ae {
            AquaError::Config(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
            AquaError::Device(msg) => format!(
                "What happened: The tank controller is unreachable ({msg}).\nLikely causes: Wrong [device] port, cable unplugged, or no permission on the serial device.\nHow to fix: Check the port (or set AQUA_PORT), the wiring and group membership, or use --simulate."
            ),
            AquaError::Timeout(what) => format!(
                "What happened: Timed out waiting for {what}.\nLikely causes: Wrong baud rate, firmware not running, or a line full of CRC errors.\nHow to fix: Check [device] baud and rerun with --log-level=debug to see dropped lines."
            ),
            AquaError::Predictor(msg) => format!(
                "What happened: The trough predictor is unusable ({msg}).\nLikely causes: The model file is missing, from another feature layout, or the dataset has no usable rows.\nHow to fix: Retrain with `aqua dataset train` or remove prediction.model."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // Generic fallback
    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: dataset 3, configuration 4, device 5, anything else 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match reason_name(err) {
        "Dataset" => 3,
        "Config" => 4,
        "Device" | "Timeout" => 5,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "message": humanize(err),
        "exit_code": exit_code_for_error(err),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_to_exit_codes() {
        let cases: [(eyre::Report, i32); 5] = [
            (DatasetError::Corrupt("x".into()).into(), 3),
            (AquaError::Config("device.port".into()).into(), 4),
            (AquaError::Device("/dev/ttyUSB0".into()).into(), 5),
            (AquaError::Timeout("frame").into(), 5),
            (eyre::eyre!("boom"), 1),
        ];
        for (err, code) in cases {
            assert_eq!(exit_code_for_error(&err), code, "{err}");
        }
    }

    #[test]
    fn json_carries_reason_and_message() {
        let err: eyre::Report = AquaError::Config("ph.v1 and ph.v2 must differ".into()).into();
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "Config");
        assert_eq!(v["exit_code"], 4);
        assert!(v["message"].as_str().unwrap().contains("ph.v1"));
    }

    #[test]
    fn wrapped_errors_keep_their_class() {
        use eyre::WrapErr;
        let err = Err::<(), _>(DatasetError::Corrupt("eof".into()))
            .wrap_err("opening dataset")
            .unwrap_err();
        assert_eq!(exit_code_for_error(&err), 3);
    }
}
