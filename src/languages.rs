//! Static registry of the supported languages and their execution profiles.
//!
//! Adding a language is a table insertion: every per-language decision (images,
//! commands, file names, whether a compile stage exists) lives in its profile.

use crate::config::ImageOverrides;

const DEFAULT_GXX_IMAGE: &str = "frolvlad/alpine-gxx";
const DEFAULT_RUST_IMAGE: &str = "frolvlad/alpine-rust";
const DEFAULT_RUNTIME_IMAGE: &str = "alpine:latest";
const DEFAULT_PYTHON_IMAGE: &str = "python:alpine3.16";
const DEFAULT_NODEJS_IMAGE: &str = "node:16.13.0-alpine3.14";

/// Execution parameters for one supported language.
///
/// The `--static` and `crt-static` flags in the compile commands are load-bearing: the
/// produced binary must run inside the minimal runtime image, which carries no libc the
/// compiler image would link against.
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Registry tag, as carried in submission records.
    pub language: &'static str,
    /// Image used for the compile stage, when one exists.
    pub compile_image: Option<String>,
    /// Command run inside the compile image.
    pub compile_cmd: Option<&'static str>,
    /// Name the source file is materialized under in the scratch directory.
    pub source_name: &'static str,
    /// Image used for the run stage.
    pub runtime_image: String,
    /// Command executing the program.
    pub run_cmd: &'static str,
}

impl LanguageProfile {
    /// Whether this language goes through a compile stage before running.
    pub fn needs_compile(&self) -> bool {
        self.compile_image.is_some()
    }
}

/// Table of the supported language profiles.
#[derive(Debug, Clone)]
pub struct Registry {
    profiles: Vec<LanguageProfile>,
}

impl Registry {
    /// Build the registry, applying the configured image overrides.
    pub fn new(images: &ImageOverrides) -> Self {
        let or_default =
            |image: &Option<String>, default: &str| image.clone().unwrap_or_else(|| default.into());

        Registry {
            profiles: vec![
                LanguageProfile {
                    language: "c",
                    compile_image: Some(or_default(&images.c_compiler, DEFAULT_GXX_IMAGE)),
                    compile_cmd: Some("gcc --static code.c -o code"),
                    source_name: "code.c",
                    runtime_image: DEFAULT_RUNTIME_IMAGE.into(),
                    run_cmd: "./code",
                },
                LanguageProfile {
                    language: "cpp",
                    compile_image: Some(or_default(&images.cpp_compiler, DEFAULT_GXX_IMAGE)),
                    compile_cmd: Some("c++ --static code.cpp -o code"),
                    source_name: "code.cpp",
                    runtime_image: DEFAULT_RUNTIME_IMAGE.into(),
                    run_cmd: "./code",
                },
                LanguageProfile {
                    language: "rust",
                    compile_image: Some(or_default(&images.rust_compiler, DEFAULT_RUST_IMAGE)),
                    compile_cmd: Some("rustc -C target-feature=+crt-static code.rs -o code"),
                    source_name: "code.rs",
                    runtime_image: DEFAULT_RUNTIME_IMAGE.into(),
                    run_cmd: "./code",
                },
                LanguageProfile {
                    language: "python",
                    compile_image: None,
                    compile_cmd: None,
                    source_name: "code.py",
                    runtime_image: or_default(&images.python_interpreter, DEFAULT_PYTHON_IMAGE),
                    run_cmd: "python code.py",
                },
                LanguageProfile {
                    language: "nodejs",
                    compile_image: None,
                    compile_cmd: None,
                    source_name: "code.js",
                    runtime_image: or_default(&images.nodejs_interpreter, DEFAULT_NODEJS_IMAGE),
                    run_cmd: "node code.js",
                },
            ],
        }
    }

    /// Look up a profile by its language tag.
    pub fn get(&self, language: &str) -> Option<&LanguageProfile> {
        self.profiles.iter().find(|p| p.language == language)
    }

    /// Every image referenced by the table, deduplicated, for the startup pre-pull.
    pub fn images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = Vec::new();
        for profile in &self.profiles {
            if let Some(image) = profile.compile_image.as_deref() {
                if !images.contains(&image) {
                    images.push(image);
                }
            }
            if !images.contains(&profile.runtime_image.as_str()) {
                images.push(&profile.runtime_image);
            }
        }
        images
    }

    /// Source file names used by any profile, for scratch cleanup.
    pub fn source_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.profiles.iter().map(|p| p.source_name)
    }
}
