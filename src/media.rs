use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    WithAudio,
    WithoutAudio,
    InvalidOrCorrupt,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::WithAudio,
        Category::WithoutAudio,
        Category::InvalidOrCorrupt,
    ];

    pub fn folder(self) -> &'static str {
        match self {
            Category::WithAudio => "With_Audio",
            Category::WithoutAudio => "Without_Audio",
            Category::InvalidOrCorrupt => "Invalid_or_Corrupt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaProbe {
    pub has_audio: bool,
}

fn tool_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    hide_console(&mut cmd);
    cmd
}

#[cfg(windows)]
fn hide_console(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_cmd: &mut Command) {}

pub fn probe(paths: &AppPaths, input: &Path) -> Result<MediaProbe> {
    probe_with(&paths.ffprobe_cmd(), input)
}

fn probe_with(ffprobe: &Path, input: &Path) -> Result<MediaProbe> {
    let output = tool_command(ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(input)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffprobe".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    if !output.status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffprobe".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe(&output.stdout)
}

fn parse_probe(stdout: &[u8]) -> Result<MediaProbe> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    Ok(MediaProbe {
        has_audio: parsed
            .streams
            .iter()
            .any(|st| st.codec_type.as_deref() == Some("audio")),
    })
}

/// Moves a freshly downloaded file into its category folder.
///
/// Returns `None` when ffprobe is not installed; the file then stays in the
/// download root.
pub fn categorize(
    paths: &AppPaths,
    download_dir: &Path,
    file: &Path,
) -> Result<Option<(Category, PathBuf)>> {
    categorize_with(&paths.ffprobe_cmd(), download_dir, file)
}

fn categorize_with(
    ffprobe: &Path,
    download_dir: &Path,
    file: &Path,
) -> Result<Option<(Category, PathBuf)>> {
    let category = match probe_with(ffprobe, file) {
        Ok(probe) if probe.has_audio => Category::WithAudio,
        Ok(_) => Category::WithoutAudio,
        Err(EngineError::ExternalToolMissing { .. }) => {
            warn!(file = %file.display(), "ffprobe not found; leaving file uncategorized");
            return Ok(None);
        }
        Err(e) => {
            warn!(file = %file.display(), error = %e, "ffprobe could not read file");
            Category::InvalidOrCorrupt
        }
    };

    let dest = move_into(download_dir, category, file)?;
    info!(file = %dest.display(), category = category.folder(), "categorized");
    Ok(Some((category, dest)))
}

fn move_into(download_dir: &Path, category: Category, file: &Path) -> Result<PathBuf> {
    let folder = download_dir.join(category.folder());
    std::fs::create_dir_all(&folder)?;
    let name = file
        .file_name()
        .ok_or_else(|| EngineError::InvalidInput(format!("not a file: {}", file.display())))?;
    let dest = folder.join(name);
    std::fs::rename(file, &dest)?;
    Ok(dest)
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_kinds() {
        let json = br#"{"streams":[{"codec_type":"video","codec_name":"h264"},{"codec_type":"audio"}]}"#;
        assert!(parse_probe(json).expect("parse").has_audio);

        let silent = parse_probe(br#"{"streams":[{"codec_type":"video"}]}"#).expect("parse");
        assert!(!silent.has_audio);

        let empty = parse_probe(b"{}").expect("parse");
        assert!(!empty.has_audio);
    }

    #[test]
    fn folder_names_are_distinct() {
        let mut names: Vec<_> = Category::ALL.iter().map(|c| c.folder()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn missing_probe_tool_leaves_file_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"bytes").expect("write");

        let missing_tool = dir.path().join("no-such-ffprobe-binary");
        let result = categorize_with(&missing_tool, dir.path(), &file).expect("categorize");
        assert!(result.is_none());
        assert!(file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_probe_moves_file_to_corrupt_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"bytes").expect("write");

        // `false` exits non-zero without output.
        let result = categorize_with(Path::new("false"), dir.path(), &file)
            .expect("categorize")
            .expect("categorized");
        assert_eq!(result.0, Category::InvalidOrCorrupt);
        assert_eq!(result.1, dir.path().join("Invalid_or_Corrupt").join("clip.mp4"));
        assert!(result.1.exists());
        assert!(!file.exists());
    }
}
