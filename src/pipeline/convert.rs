//! Convert stage: rendered document → final-format document.
//!
//! [`CommandConverter`] shells out to an external engine, by default
//! `soffice --headless --convert-to pdf`. Such engines are usually a single
//! process-wide instance, so the converter reports itself as non-reentrant
//! and the orchestrator holds the conversion gate around each call.

use crate::artifact::{Artifact, ArtifactSlot, ArtifactStage};
use crate::config::ConverterCommand;
use crate::error::ConversionError;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Longest stderr excerpt kept in an error message, in characters.
const STDERR_EXCERPT_CHARS: usize = 500;

/// Turns a rendered artifact into the deliverable format.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `source`, writing the result into `slot.dir`.
    async fn convert(&self, source: &Artifact, slot: &ArtifactSlot<'_>) -> Result<Artifact, ConversionError>;

    /// Whether concurrent calls are safe. Non-reentrant converters are
    /// serialised through [`crate::gate::conversion_engine`].
    fn is_reentrant(&self) -> bool {
        false
    }
}

/// Runs an external command once per document.
#[derive(Debug, Clone, Default)]
pub struct CommandConverter {
    command: ConverterCommand,
}

impl CommandConverter {
    pub fn new(command: ConverterCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &ConverterCommand {
        &self.command
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, source: &Artifact, slot: &ArtifactSlot<'_>) -> Result<Artifact, ConversionError> {
        check_source(source).await?;

        let input = source.path().to_string_lossy();
        let outdir = slot.dir.to_string_lossy();
        let args = self.command.expand_args(&input, &outdir, slot.stem);
        debug!("Converting {} with {} {:?}", source.name(), self.command.program, args);

        let output = tokio::process::Command::new(&self.command.program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = excerpt(&String::from_utf8_lossy(&output.stderr));
            warn!("{} exited with {} for {}", self.command.program, output.status, source.name());
            return Err(ConversionError::ProcessFailed {
                program: self.command.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        let path = slot.path_with_extension(&self.command.output_extension);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                Ok(slot.artifact(ArtifactStage::Converted, path))
            }
            _ => Err(ConversionError::MissingOutput { name: source.name() }),
        }
    }
}

/// Reject sources that are absent, empty, or not rendered documents.
async fn check_source(source: &Artifact) -> Result<(), ConversionError> {
    let malformed = |detail: &str| ConversionError::MalformedSource {
        name: source.name(),
        detail: detail.to_string(),
    };

    if source.stage() != ArtifactStage::Rendered {
        return Err(malformed("not a rendered document"));
    }
    match tokio::fs::metadata(source.path()).await {
        Ok(meta) if meta.len() == 0 => Err(malformed("document is empty")),
        Ok(_) => Ok(()),
        Err(_) => Err(malformed("document does not exist")),
    }
}

/// Check that a converter honoured its contract for `source`.
///
/// Applied to every converter's output, built-in or injected.
pub fn verify_output(source: &Artifact, output: &Artifact) -> Result<(), ConversionError> {
    let malformed = |detail: String| ConversionError::MalformedOutput {
        name: source.name(),
        detail,
    };

    if output.stage() != ArtifactStage::Converted {
        return Err(malformed("artifact is not marked as converted".into()));
    }
    if output.record_id() != source.record_id() {
        return Err(malformed(format!(
            "artifact belongs to record '{}'",
            output.record_id()
        )));
    }
    if !output.path().is_file() {
        return Err(malformed("artifact file does not exist".into()));
    }
    Ok(())
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.chars().count() <= STDERR_EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(STDERR_EXCERPT_CHARS).collect();
        format!("{cut}…")
    }
}
