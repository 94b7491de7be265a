//! Ensures all workspace crates use `version.workspace = true` and that
//! the workspace version is consistent across all Cargo.toml files.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    toml::from_str(&text).unwrap()
}

/// `"workspace"` when the crate inherits its version, else the literal.
fn crate_version(manifest_dir: &Path) -> String {
    let doc = manifest(manifest_dir);
    let version = &doc["package"]["version"];
    if let Some(table) = version.as_table() {
        if table.get("workspace").and_then(|v| v.as_bool()) == Some(true) {
            return "workspace".to_string();
        }
    }
    match version.as_str() {
        Some(v) => v.to_string(),
        None => panic!(
            "Could not read version from {}",
            manifest_dir.join("Cargo.toml").display()
        ),
    }
}

#[test]
fn all_crates_use_workspace_version() {
    let root = workspace_root();
    let members: Vec<String> = manifest(&root)["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect();
    assert_eq!(members, ["crates/surveysift-core", "crates/surveysift-cli"]);

    for krate in &members {
        let version = crate_version(&root.join(krate));
        assert_eq!(
            version, "workspace",
            "{} should use version.workspace = true, got version = {:?}",
            krate, version
        );
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    let doc = manifest(&workspace_root());
    let ws_version = doc["workspace"]["package"]["version"].as_str().unwrap();
    assert_eq!(ws_version, env!("CARGO_PKG_VERSION"));
    assert_eq!(surveysift_core::VERSION, ws_version);
}

#[test]
fn internal_dependency_pins_workspace_version() {
    let doc = manifest(&workspace_root());
    let ws_version = doc["workspace"]["package"]["version"].as_str().unwrap();
    let pinned = doc["workspace"]["dependencies"]["surveysift-core"]["version"]
        .as_str()
        .unwrap();
    assert_eq!(pinned, ws_version);
}

/// Every regular dependency of the binary crate is referenced from its sources.
#[test]
fn cli_dependencies_are_used() {
    let cli = workspace_root().join("crates/surveysift-cli");
    let doc = manifest(&cli);
    let mut sources = String::new();
    for entry in std::fs::read_dir(cli.join("src")).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            sources.push_str(&std::fs::read_to_string(&path).unwrap());
        }
    }

    let deps = doc["dependencies"].as_table().unwrap();
    assert!(!deps.contains_key("serde"));
    for name in deps.keys() {
        let ident = name.replace('-', "_");
        assert!(
            sources.contains(&format!("{ident}::")) || sources.contains(&format!("use {ident}")),
            "surveysift-cli declares {name} but never uses it"
        );
    }
}
