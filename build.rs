fn main() {
    // Version/commit stamps are best-effort: outside a git checkout there is
    // nothing to stamp, and the binary falls back to <none> for each field.
    if let Err(e) = vergen::vergen(vergen::Config::default()) {
        println!("cargo:warning=build metadata unavailable: {e}");
    }
}
