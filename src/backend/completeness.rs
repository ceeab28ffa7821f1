//! Framebuffer completeness rules shared by every backend

use crate::backend::types::{AttachmentSlot, TextureFormat};
use thiserror::Error;

/// Why a framebuffer cannot be drawn into
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletenessError {
    #[error("one of the attachment points is framebuffer incomplete")]
    IncompleteAttachment,
    #[error("there are no attachments")]
    MissingAttachment,
    #[error("draw buffer is incomplete")]
    IncompleteDrawBuffer,
    #[error("read buffer is incomplete")]
    IncompleteReadBuffer,
    #[error("check the formats of the attached targets")]
    Unsupported,
    #[error("check the multisampling parameters on all attached targets")]
    IncompleteMultisample,
    #[error("layered attachments do not match")]
    IncompleteLayerTargets,
    #[error("unknown reason")]
    Unknown,
}

/// What a backend knows about one attached store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
}

/// Evaluate completeness of a framebuffer
///
/// `attachments` pairs each occupied slot with the store behind it; `None` means the
/// handle no longer refers to a live store.
pub fn evaluate(
    attachments: &[(AttachmentSlot, Option<AttachmentInfo>)],
    draw_slots: &[AttachmentSlot],
    is_supported: impl Fn(TextureFormat) -> bool,
) -> Result<(), CompletenessError> {
    if attachments.is_empty() {
        return Err(CompletenessError::MissingAttachment);
    }

    for (slot, info) in attachments {
        let Some(info) = info else {
            return Err(CompletenessError::IncompleteAttachment);
        };
        if info.width == 0 || info.height == 0 || info.samples == 0 {
            return Err(CompletenessError::IncompleteAttachment);
        }
        if !slot_accepts(*slot, info.format) {
            return Err(CompletenessError::IncompleteAttachment);
        }
    }

    for (_, info) in attachments.iter() {
        if let Some(info) = info {
            if !is_supported(info.format) {
                return Err(CompletenessError::Unsupported);
            }
        }
    }

    let has_depth = attachments
        .iter()
        .any(|(slot, _)| *slot == AttachmentSlot::Depth);
    let has_stencil = attachments
        .iter()
        .any(|(slot, _)| *slot == AttachmentSlot::Stencil);
    let has_depth_stencil = attachments
        .iter()
        .any(|(slot, _)| *slot == AttachmentSlot::DepthStencil);
    if has_depth_stencil && (has_depth || has_stencil) {
        return Err(CompletenessError::Unsupported);
    }

    let mut samples = attachments.iter().filter_map(|(_, info)| info.map(|i| i.samples));
    if let Some(first) = samples.next() {
        if samples.any(|count| count != first) {
            return Err(CompletenessError::IncompleteMultisample);
        }
    }

    for slot in draw_slots {
        if !attachments.iter().any(|(attached, _)| attached == slot) {
            return Err(CompletenessError::IncompleteDrawBuffer);
        }
    }

    Ok(())
}

fn slot_accepts(slot: AttachmentSlot, format: TextureFormat) -> bool {
    match slot {
        AttachmentSlot::Depth => format.has_depth(),
        AttachmentSlot::Stencil => format.has_stencil(),
        AttachmentSlot::DepthStencil => format.has_depth() && format.has_stencil(),
        _ => format.is_color(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: TextureFormat, samples: u32) -> Option<AttachmentInfo> {
        Some(AttachmentInfo {
            format,
            width: 64,
            height: 64,
            samples,
        })
    }

    #[test]
    fn test_empty_is_missing_attachment() {
        assert_eq!(
            evaluate(&[], &[], |_| true),
            Err(CompletenessError::MissingAttachment)
        );
    }

    #[test]
    fn test_color_and_depth_complete() {
        let attachments = [
            (AttachmentSlot::Color0, info(TextureFormat::Rgb8, 1)),
            (AttachmentSlot::Depth, info(TextureFormat::Depth32, 1)),
        ];
        assert_eq!(
            evaluate(&attachments, &[AttachmentSlot::Color0], |_| true),
            Ok(())
        );
    }

    #[test]
    fn test_depth_format_in_color_slot() {
        let attachments = [(AttachmentSlot::Color0, info(TextureFormat::Depth24, 1))];
        assert_eq!(
            evaluate(&attachments, &[], |_| true),
            Err(CompletenessError::IncompleteAttachment)
        );
    }

    #[test]
    fn test_sample_mismatch() {
        let attachments = [
            (AttachmentSlot::Color0, info(TextureFormat::Rgba8, 4)),
            (AttachmentSlot::Depth, info(TextureFormat::Depth32, 1)),
        ];
        assert_eq!(
            evaluate(&attachments, &[], |_| true),
            Err(CompletenessError::IncompleteMultisample)
        );
    }

    #[test]
    fn test_color_sample_mismatch_across_draw_slots() {
        let attachments = [
            (AttachmentSlot::Color0, info(TextureFormat::Rgba8, 4)),
            (AttachmentSlot::Color1, info(TextureFormat::Rgba8, 1)),
        ];
        assert_eq!(
            evaluate(
                &attachments,
                &[AttachmentSlot::Color0, AttachmentSlot::Color1],
                |_| true
            ),
            Err(CompletenessError::IncompleteMultisample)
        );
    }

    #[test]
    fn test_draw_slot_without_attachment() {
        let attachments = [(AttachmentSlot::Color0, info(TextureFormat::Rgba8, 1))];
        assert_eq!(
            evaluate(
                &attachments,
                &[AttachmentSlot::Color0, AttachmentSlot::Color1],
                |_| true
            ),
            Err(CompletenessError::IncompleteDrawBuffer)
        );
    }

    #[test]
    fn test_unsupported_format() {
        let attachments = [(AttachmentSlot::Stencil, info(TextureFormat::Stencil4, 1))];
        assert_eq!(
            evaluate(&attachments, &[], |format| format != TextureFormat::Stencil4),
            Err(CompletenessError::Unsupported)
        );
    }

    #[test]
    fn test_dangling_handle() {
        let attachments = [(AttachmentSlot::Color0, None)];
        assert_eq!(
            evaluate(&attachments, &[], |_| true),
            Err(CompletenessError::IncompleteAttachment)
        );
    }
}
