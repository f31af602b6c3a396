use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
  println!("cargo:rerun-if-changed=src");

  let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
  let src_dir = manifest_dir.join("src");

  let mut files = Vec::new();
  collect_rs_files(&src_dir, &mut files);
  files.sort();

  let mut hasher = Sha256::new();
  for file in &files {
    let contents = fs::read(file).unwrap_or_else(|e| panic!("failed to read {}: {e}", file.display()));
    hasher.update(&contents);
  }
  let digest: [u8; 32] = hasher.finalize().into();

  let rendered: String = digest.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", ");
  let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
  fs::write(
    out_dir.join("program_digest.rs"),
    format!("pub const PROGRAM_DIGEST: [u8; 32] = [{rendered}];\n"),
  )
  .expect("failed to write program_digest.rs");
}

fn collect_rs_files(dir: &Path, out: &mut Vec<PathBuf>) {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(_) => return,
  };
  for entry in entries.flatten() {
    let path = entry.path();
    if path.is_dir() {
      collect_rs_files(&path, out);
    } else if path.extension().is_some_and(|ext| ext == "rs") {
      out.push(path);
    }
  }
}
