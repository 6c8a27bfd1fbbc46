//! Streaming compression framing for the TCP side.
//!
//! One flush of the pack buffer becomes one zstd frame; the decoder hands
//! every completed frame to the caller and re-initializes itself, so frame
//! boundaries double as the protocol's message boundaries. TCP is free to
//! split frames across reads; the decoder carries partial state forward.

use anyhow::{bail, Context};
use bytes::BytesMut;
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::config::COMPRESSION_LEVEL;

pub struct FrameEncoder {
    ctx: Encoder<'static>,
    scratch: Vec<u8>,
}

impl FrameEncoder {
    pub fn new() -> anyhow::Result<FrameEncoder> {
        Ok(FrameEncoder {
            ctx: Encoder::new(COMPRESSION_LEVEL).context("creating compression context")?,
            scratch: vec![0u8; zstd::zstd_safe::CCtx::out_size()],
        })
    }

    /// Compresses `plain` as one complete frame. Every chunk of compressed
    /// output is handed to `sink` as it is produced, mutable so the caller
    /// can encrypt in place before queueing.
    pub fn compress_frame(
        &mut self,
        plain: &[u8],
        mut sink: impl FnMut(&mut [u8]),
    ) -> anyhow::Result<()> {
        self.ctx.reinit().context("resetting compression context")?;

        let mut input = InBuffer::around(plain);
        while input.pos < plain.len() {
            let mut output = OutBuffer::around(&mut self.scratch[..]);
            self.ctx
                .run(&mut input, &mut output)
                .context("compressing frame")?;
            let produced = output.pos();
            if produced > 0 {
                sink(&mut self.scratch[..produced]);
            }
        }

        loop {
            let mut output = OutBuffer::around(&mut self.scratch[..]);
            let remaining = self
                .ctx
                .finish(&mut output, true)
                .context("finishing frame")?;
            let produced = output.pos();
            if produced > 0 {
                sink(&mut self.scratch[..produced]);
            }
            if remaining == 0 {
                return Ok(());
            }
        }
    }
}

pub struct FrameDecoder {
    ctx: Decoder<'static>,
    scratch: Vec<u8>,
    frame: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> anyhow::Result<FrameDecoder> {
        Ok(FrameDecoder {
            ctx: Decoder::new().context("creating decompression context")?,
            scratch: vec![0u8; zstd::zstd_safe::DCtx::out_size()],
            frame: BytesMut::new(),
        })
    }

    /// Feeds decrypted stream bytes into the decoder. Each completed frame
    /// is passed to `on_frame`; incomplete frames wait for the next read.
    /// Errors (corrupt data, oversized frame, failing `on_frame`) are
    /// terminal for the stream.
    pub fn feed(
        &mut self,
        src: &[u8],
        mut on_frame: impl FnMut(&[u8]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut input = InBuffer::around(src);
        loop {
            let before = input.pos;
            let mut output = OutBuffer::around(&mut self.scratch[..]);
            let hint = self
                .ctx
                .run(&mut input, &mut output)
                .context("corrupt compressed data")?;
            let produced = output.pos();

            if self.frame.len() + produced > self.scratch.len() {
                bail!(
                    "frame exceeds the {} byte decompression budget",
                    self.scratch.len()
                );
            }
            self.frame.extend_from_slice(&self.scratch[..produced]);

            if hint == 0 {
                on_frame(&self.frame)?;
                self.frame.clear();
                self.ctx.reinit().context("resetting decompression context")?;
            } else if input.pos == before && produced == 0 {
                bail!("decompressor made no progress");
            }

            if input.pos >= src.len() {
                return Ok(());
            }
        }
    }
}
