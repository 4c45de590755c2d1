//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Build script.
//!

fn main() {
    let output_dir = std::env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let version_path = std::path::Path::new(&output_dir).join("version");

    let version_str = format!("{} ({})", env!("CARGO_PKG_VERSION"), get_commit_hash());

    std::fs::write(version_path, version_str).expect("cannot write version file");

    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn get_commit_hash() -> String {
    let output = std::process::Command::new("git")
        .arg("log").arg("-1")
        .arg("--pretty=format:%h")
        .arg("--abbrev=8")
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .output();

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).to_string(),
        _ => "unspecified".to_string()
    }
}
