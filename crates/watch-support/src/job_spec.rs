//! Loads a job specification file for the `run`/`start` subcommands.
//!
//! Only literal JSON job specs are accepted; this tool does not embed an
//! HCL parser (the original's `nomad job run` shells out to the `nomad`
//! binary itself for that conversion, which is exactly why a caller who
//! wants HCL here is expected to run `nomad job run -output` first and pass
//! the resulting JSON).

use std::path::Path;

use serde_json::Value;

/// Reads and parses a job spec file. `assume_json` mirrors the `--json`
/// flag; when false and the file fails to parse as JSON, the error message
/// points the caller at `--json`/pre-conversion rather than silently
/// attempting HCL.
pub fn load_job_spec(path: &Path, assume_json: bool) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading job spec {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| {
        if assume_json {
            anyhow::anyhow!("{} is not valid JSON: {e}", path.display())
        } else {
            anyhow::anyhow!(
                "{} is not valid JSON ({e}); this tool only accepts JSON job specs, \
                 convert HCL with `nomad job run -output` first and pass --json",
                path.display()
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn valid_json_spec_loads() {
        let mut file = tempfile_with(r#"{"ID":"web"}"#);
        let value = load_job_spec(file.path(), true).unwrap();
        assert_eq!(value["ID"], "web");
        file.flush().ok();
    }

    #[test]
    fn non_json_spec_points_at_json_flag() {
        let file = tempfile_with("job \"web\" {}");
        let err = load_job_spec(file.path(), false).unwrap_err();
        assert!(err.to_string().contains("--json"));
    }

    fn tempfile_with(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }
}
