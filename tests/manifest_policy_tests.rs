#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for heist-sync.
//!
//! These tests verify that Cargo.toml and the files it points at conform to
//! project policy. If any test fails, the manifest has drifted from the
//! agreed-upon standards.
//!
//! All checks are synchronous filesystem reads, no network access or async
//! runtime needed.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Reads a file relative to the project root and returns its contents.
fn read_project_file(relative_path: &str) -> String {
    let path = project_root().join(relative_path);
    std::fs::read_to_string(&path).unwrap_or_else(|e| {
        panic!(
            "Failed to read '{}': {}. This file is required by project policy.",
            path.display(),
            e
        )
    })
}

/// Parses Cargo.toml.
fn manifest() -> toml::Table {
    read_project_file("Cargo.toml")
        .parse::<toml::Table>()
        .unwrap_or_else(|e| panic!("Cargo.toml is not valid TOML: {e}"))
}

fn table<'a>(parent: &'a toml::Table, key: &str) -> &'a toml::Table {
    parent
        .get(key)
        .and_then(toml::Value::as_table)
        .unwrap_or_else(|| panic!("Cargo.toml is missing the [{key}] table"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_denies_all_panic_prone_lints() {
        let manifest = manifest();
        let clippy = table(table(&manifest, "lints"), "clippy");

        for lint in REQUIRED_DENY_LINTS {
            assert_eq!(
                clippy.get(*lint).and_then(toml::Value::as_str),
                Some("deny"),
                "[lints.clippy] must set `{lint} = \"deny\"`. All panic-prone \
                 lints are denied to keep library code panic-free."
            );
        }
    }

    #[test]
    fn library_sources_do_not_opt_out_outside_tests() {
        let src = project_root().join("src");
        let mut stack = vec![src];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let contents = std::fs::read_to_string(&path).unwrap();
                let body = contents
                    .split("#[cfg(test)]")
                    .next()
                    .unwrap_or_default();
                assert!(
                    !body.contains("clippy::unwrap_used"),
                    "{} allows unwrap_used outside its test module",
                    path.display()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: package_metadata
// ─────────────────────────────────────────────────────────────────────────────

mod package_metadata {
    use super::*;

    #[test]
    fn rust_version_is_pinned() {
        let manifest = manifest();
        let package = table(&manifest, "package");
        let msrv = package
            .get("rust-version")
            .and_then(toml::Value::as_str)
            .expect("package.rust-version must be set");

        let parts: Vec<&str> = msrv.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "rust-version '{msrv}' should be a full MAJOR.MINOR.PATCH version"
        );
        assert!(
            parts.iter().all(|p| p.parse::<u32>().is_ok()),
            "rust-version '{msrv}' must be numeric"
        );
    }

    #[test]
    fn edition_is_2021() {
        let manifest = manifest();
        assert_eq!(
            table(&manifest, "package")
                .get("edition")
                .and_then(toml::Value::as_str),
            Some("2021")
        );
    }

    #[test]
    fn readme_exists() {
        assert!(
            project_root().join("README.md").is_file(),
            "package.readme points at README.md, which must exist"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    #[test]
    fn default_features_ship_rest_backend_and_file_storage() {
        let manifest = manifest();
        let default: Vec<&str> = table(&manifest, "features")
            .get("default")
            .and_then(toml::Value::as_array)
            .expect("[features] must declare `default`")
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();

        assert!(default.contains(&"backend-rest"));
        assert!(default.contains(&"file-storage"));
    }

    #[test]
    fn rest_client_is_optional() {
        let manifest = manifest();
        let reqwest = table(&manifest, "dependencies")
            .get("reqwest")
            .and_then(toml::Value::as_table)
            .expect("reqwest must be declared with a table");
        assert_eq!(
            reqwest.get("optional").and_then(toml::Value::as_bool),
            Some(true),
            "reqwest must stay behind the backend-rest feature"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: example_policy
// ─────────────────────────────────────────────────────────────────────────────

mod example_policy {
    use super::*;

    #[test]
    fn declared_examples_exist() {
        let manifest = manifest();
        let examples = manifest
            .get("example")
            .and_then(toml::Value::as_array)
            .expect("Cargo.toml should declare [[example]] targets");

        for example in examples {
            let path = example
                .get("path")
                .and_then(toml::Value::as_str)
                .expect("every [[example]] needs an explicit path");
            assert!(
                project_root().join(path).is_file(),
                "example path '{path}' does not exist"
            );
        }
    }
}
