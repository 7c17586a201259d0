//! Every workspace crate takes its version from the root manifest.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    text.parse().unwrap()
}

fn workspace_version() -> String {
    manifest(&workspace_root())["workspace"]["package"]["version"]
        .as_str()
        .unwrap()
        .to_string()
}

#[test]
fn all_crates_use_workspace_version() {
    let root = workspace_root();
    let members = manifest(&root)["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        members,
        ["crates/epicflow-registry", "crates/epicflow-core", "crates/epicflow-cli"]
    );

    for member in &members {
        let doc = manifest(&root.join(member));
        let inherited = doc["package"]["version"]
            .get("workspace")
            .and_then(|v| v.as_bool());
        assert_eq!(
            inherited,
            Some(true),
            "{member} should use version.workspace = true"
        );
    }
}

#[test]
fn internal_dependencies_pin_the_workspace_version() {
    let root = workspace_root();
    let version = workspace_version();
    let deps = &manifest(&root)["workspace"]["dependencies"];
    for name in ["epicflow-registry", "epicflow-core"] {
        assert_eq!(
            deps[name]["version"].as_str(),
            Some(version.as_str()),
            "{name} is pinned to a different version"
        );
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    assert_eq!(workspace_version(), env!("CARGO_PKG_VERSION"));
}
