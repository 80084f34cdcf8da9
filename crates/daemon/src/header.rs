//! Container headers written around the raw frame stream.

use crate::frames::{ClipInfo, Frame, Subsampling};
use crate::jobs::EncodingHeaderType;

/// Produces the optional stream header and per-frame framing bytes.
pub trait HeaderWriter: Send {
    fn need_video_header(&self) -> bool;
    fn video_header(&self, total_frames: u64) -> Vec<u8>;
    fn need_frame_prefix(&self) -> bool;
    fn frame_prefix(&self, frame: &Frame) -> Vec<u8>;
    fn need_frame_postfix(&self) -> bool;
    fn frame_postfix(&self, frame: &Frame) -> Vec<u8>;
}

/// Build the writer for a job's header type.
pub fn header_writer(kind: EncodingHeaderType, clip: &ClipInfo) -> Box<dyn HeaderWriter> {
    match kind {
        EncodingHeaderType::NoHeader => Box::new(NoHeader),
        EncodingHeaderType::Y4m => Box::new(Y4mHeader::new(clip.clone())),
    }
}

/// Raw frames, nothing around them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeader;

impl HeaderWriter for NoHeader {
    fn need_video_header(&self) -> bool {
        false
    }

    fn video_header(&self, _total_frames: u64) -> Vec<u8> {
        Vec::new()
    }

    fn need_frame_prefix(&self) -> bool {
        false
    }

    fn frame_prefix(&self, _frame: &Frame) -> Vec<u8> {
        Vec::new()
    }

    fn need_frame_postfix(&self) -> bool {
        false
    }

    fn frame_postfix(&self, _frame: &Frame) -> Vec<u8> {
        Vec::new()
    }
}

/// YUV4MPEG2 stream framing.
#[derive(Debug, Clone)]
pub struct Y4mHeader {
    clip: ClipInfo,
}

impl Y4mHeader {
    pub fn new(clip: ClipInfo) -> Self {
        Self { clip }
    }

    fn colorspace(&self) -> String {
        let bits = self.clip.bits_per_sample;
        match (self.clip.subsampling, bits) {
            (Subsampling::Yuv420, 8) => "420jpeg".to_string(),
            (Subsampling::Yuv420, b) => format!("420p{}", b),
            (Subsampling::Yuv422, 8) => "422".to_string(),
            (Subsampling::Yuv422, b) => format!("422p{}", b),
            (Subsampling::Yuv444, 8) => "444".to_string(),
            (Subsampling::Yuv444, b) => format!("444p{}", b),
            (Subsampling::Gray, 8) => "mono".to_string(),
            (Subsampling::Gray, b) => format!("mono{}", b),
        }
    }
}

impl HeaderWriter for Y4mHeader {
    fn need_video_header(&self) -> bool {
        true
    }

    // Y4M has no frame count field
    fn video_header(&self, _total_frames: u64) -> Vec<u8> {
        format!(
            "YUV4MPEG2 W{} H{} F{}:{} Ip A0:0 C{}\n",
            self.clip.width,
            self.clip.height,
            self.clip.fps_num,
            self.clip.fps_den,
            self.colorspace()
        )
        .into_bytes()
    }

    fn need_frame_prefix(&self) -> bool {
        true
    }

    fn frame_prefix(&self, _frame: &Frame) -> Vec<u8> {
        b"FRAME\n".to_vec()
    }

    fn need_frame_postfix(&self) -> bool {
        false
    }

    fn frame_postfix(&self, _frame: &Frame) -> Vec<u8> {
        Vec::new()
    }
}
