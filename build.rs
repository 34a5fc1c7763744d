// build.rs — platform detection for sparse-file support.
//
// Emits `cargo:rustc-cfg=has_sparse_files` on Unix targets, where regular
// files are natively sparse and holes can be punched with fallocate(2).
// On Windows, sparse semantics require explicit DeviceIoControl calls
// (FSCTL_SET_SPARSE / FSCTL_SET_ZERO_DATA), which are handled separately.
// Tests use the cfg to gate allocated-size assertions.
fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let unix_targets = [
        "linux",
        "macos",
        "freebsd",
        "netbsd",
        "openbsd",
        "dragonfly",
        "solaris",
        "illumos",
        "android",
    ];
    if unix_targets.contains(&target_os.as_str()) || std::env::var("CARGO_CFG_UNIX").is_ok() {
        println!("cargo:rustc-cfg=has_sparse_files");
    }
}
