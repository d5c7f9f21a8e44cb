//! Layering of command line flags over a config file.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{from_value, to_value, Result, Value};

/// Overlays `patch` onto `base` through their JSON forms.
///
/// A field of `patch` only wins if it differs from the field of `T::default()`,
/// so flags left at their default on the command line keep the file's value.
pub fn merge<T>(base: &T, patch: &T) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut merged = to_value(base)?;
    let defaults = to_value(T::default())?;
    overlay(&mut merged, to_value(patch)?, &defaults, "");
    from_value(merged)
}

/// Recursively overlays `patch` onto `base`, skipping values equal to the default
/// found at `pointer`.
fn overlay(base: &mut Value, patch: Value, defaults: &Value, pointer: &str) {
    match (base, patch) {
        (Value::Object(fields), Value::Object(patched)) => {
            for (name, value) in patched {
                let pointer = format!("{pointer}/{name}");
                let field = fields.entry(name).or_insert(Value::Null);
                overlay(field, value, defaults, &pointer);
            }
        }
        (field, value) => {
            if defaults.pointer(pointer) != Some(&value) {
                *field = value;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use shader_cache::config::CacheConfig;

    use super::*;

    fn from_file() -> CacheConfig {
        toml_config("include-roots = [\"common\"]\nmax-include-depth = 8\nuse-disk-cache = true")
    }

    fn toml_config(text: &str) -> CacheConfig {
        let file = shader_cache_test_utils::ShaderDir::new();
        let path = file.write("shader-cache.toml", text).unwrap();
        CacheConfig::from_toml_file(path).unwrap()
    }

    #[test_log::test]
    fn default_flags_keep_file_values() {
        let merged = merge(&from_file(), &CacheConfig::default()).unwrap();
        assert_eq!(merged, from_file());
    }

    #[test_log::test]
    fn explicit_flags_win() {
        let mut flags = CacheConfig::default();
        flags.include_roots = vec![PathBuf::from("vendor")];
        flags.disk_cache = Some(PathBuf::from("/tmp/cache"));
        let merged = merge(&from_file(), &flags).unwrap();
        assert_eq!(merged.include_roots, [PathBuf::from("vendor")]);
        assert_eq!(merged.disk_cache, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(merged.max_include_depth, 8);
        assert!(merged.use_disk_cache);
    }
}
