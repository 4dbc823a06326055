pub const YEASTRICTION_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const YEASTRICTION_BUILD_N: &str = env!("YEASTRICTION_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "Yeastriction {}\nBuild {}\nCRISPR guide RNA and primer design",
        YEASTRICTION_VERSION, YEASTRICTION_BUILD_N
    )
}
