//! Build script for fwvault
//!
//! Generates the `build` module (crate version, git commit, build time)
//! that `fwvault status` prints.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
