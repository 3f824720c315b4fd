use std::error::Error;
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
    // Builds outside a git checkout still need the variable for the version string
    if EmitBuilder::builder()
        .fail_on_error()
        .custom_build_rs(".")
        .git_describe(true, true, None)
        .emit()
        .is_err()
    {
        println!("cargo:rustc-env=VERGEN_GIT_DESCRIBE=unknown");
    }
    Ok(())
}
