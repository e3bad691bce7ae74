//! Build-time metadata, stamped by the build script and logged at startup.
//! Every constant degrades to `<none>` when the stamp is missing (source
//! tarball, no git context).

macro_rules! build_const {
    ($name:ident, $env:literal) => {
        #[allow(dead_code)]
        pub const $name: &'static str = match option_env!($env) {
            Some(value) => value,
            None => "<none>",
        };
    };
}

build_const!(PACKAGE, "CARGO_PKG_NAME");
build_const!(VERSION, "VERGEN_BUILD_SEMVER");
build_const!(COMMIT_HASH, "VERGEN_GIT_SHA");
build_const!(BUILD_TIMESTAMP, "VERGEN_BUILD_TIMESTAMP");
build_const!(RUSTC_COMMIT_HASH, "VERGEN_RUSTC_COMMIT_HASH");
