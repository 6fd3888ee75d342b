//! Reading manifest sources into the in-memory file set.

use std::fs;
use std::io::Read;
use std::path::Path;

use tracing::{debug, instrument};

use crate::core::overlay::FileSet;
use crate::error::{Error, Result};

/// Input path meaning "read standard input".
pub const STDIN_PATH: &str = "-";
/// File set name that standard input is stored under.
pub const STDIN_NAME: &str = "stdin.yaml";

/// Read every input into `files`, keyed by base file name.
///
/// Returns the stored names in input order. Standard input may be named at
/// most once; a later input with the same base name replaces the earlier one.
#[instrument(skip(stdin, files), fields(inputs = paths.len()))]
pub fn read_inputs<R: Read>(
    paths: &[String],
    mut stdin: R,
    files: &mut dyn FileSet,
) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::with_capacity(paths.len());
    let mut stdin_used = false;

    for path in paths {
        let (name, data) = if path == STDIN_PATH {
            if stdin_used {
                return Err(Error::input(STDIN_NAME, "standard input given more than once"));
            }
            stdin_used = true;
            let mut data = Vec::new();
            stdin
                .read_to_end(&mut data)
                .map_err(|err| Error::input(STDIN_NAME, err))?;
            (STDIN_NAME.to_string(), data)
        } else {
            let data = fs::read(path).map_err(|err| Error::input(path.as_str(), err))?;
            (base_name(path), data)
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::input(name, "no manifest content"));
        }

        debug!(name = %name, bytes = data.len(), "read input");
        files.write(&name, data);
        if !names.contains(&name) {
            names.push(name);
        }
    }

    Ok(names)
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
        .to_string()
}
