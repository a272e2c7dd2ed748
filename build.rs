use std::env;
use std::fs;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Get the list of features from the environment
    let features: Vec<String> = env::vars()
        .filter_map(|(key, _)| {
            key.strip_prefix("CARGO_FEATURE_")
                .map(|feature| feature.to_lowercase())
        })
        .collect();

    let feature_code = format!(
        "const ENABLED_FEATURES: [&str; {}] = {:?};",
        features.len(),
        features
    );

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    fs::create_dir_all(&out_dir)?;
    fs::write(out_dir.join("features.rs"), feature_code)?;

    // Build info for the metrics registry. A checkout without git just leaves
    // the VERGEN_* variables unset.
    #[cfg(feature = "metrics")]
    {
        let gitcl = vergen_gitcl::GitclBuilder::default()
            .sha(true)
            .branch(true)
            .build()?;

        vergen_gitcl::Emitter::default()
            .add_instructions(&gitcl)?
            .emit()?;
    }

    Ok(())
}
