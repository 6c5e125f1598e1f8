use std::path::Path;

use turbfetch_core::config::{Correction, RuntimeConfig};

use crate::{read_json, write_json_atomic, StoreError};

/// Loads the runtime config document, writing defaults when it does not exist yet.
///
/// The loaded value is always sanitized; each correction is logged and returned.
pub fn load_runtime_config(path: &Path) -> Result<(RuntimeConfig, Vec<Correction>), StoreError> {
    let mut cfg = match read_json::<RuntimeConfig>(path)? {
        Some(cfg) => cfg,
        None => {
            let cfg = RuntimeConfig::default();
            write_json_atomic(path, &cfg)?;
            tracing::info!(
                target: "turbfetch_store",
                event = "runtime_config_defaults_written",
                path = %path.display(),
                "runtime config written with defaults"
            );
            cfg
        }
    };

    let corrections = cfg.sanitize();
    for c in &corrections {
        tracing::warn!(
            target: "turbfetch_store",
            event = "runtime_config_corrected",
            field = c.field,
            from = %c.from,
            to = %c.to,
            "runtime config value outside its absolute range"
        );
    }
    Ok((cfg, corrections))
}

pub fn save_runtime_config(path: &Path, cfg: &RuntimeConfig) -> Result<(), StoreError> {
    write_json_atomic(path, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;

    #[test]
    fn missing_document_is_created_with_defaults() -> anyhow::Result<()> {
        let root = temp_root("config-defaults")?;
        let path = root.join("runtime_config.json");

        let (cfg, corrections) = load_runtime_config(&path)?;
        assert_eq!(cfg, RuntimeConfig::default());
        assert!(corrections.is_empty());
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn out_of_range_values_are_clamped_on_load() -> anyhow::Result<()> {
        let root = temp_root("config-clamp")?;
        let path = root.join("runtime_config.json");
        std::fs::write(
            &path,
            r#"{"tunable": {"query_history_length": 40, "wait_update_padding": 9}}"#,
        )?;

        let (cfg, corrections) = load_runtime_config(&path)?;
        assert_eq!(cfg.tunable.query_history_length, 10);
        assert_eq!(cfg.tunable.wait_update_padding, 5);
        assert_eq!(corrections.len(), 2);

        // The document itself is only rewritten on explicit save.
        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.contains("40"));
        save_runtime_config(&path, &cfg)?;
        let (reloaded, corrections) = load_runtime_config(&path)?;
        assert_eq!(reloaded, cfg);
        assert!(corrections.is_empty());
        Ok(())
    }
}
