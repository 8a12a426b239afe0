/// Build-time override for release pipelines; falls back to the crate version.
const fn version_or_crate(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

pub const VERSION: &str = version_or_crate(option_env!("PORTAL_KEEPER_VERSION"));
