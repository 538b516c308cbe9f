// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vdec_sim, runs a complete decoding session against the scripted firmware and prints every
//! output frame the client receives.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use argh::FromArgs;

use imx_vdec::backend::dummy::DummyHarness;
use imx_vdec::config::RegistryValues;
use imx_vdec::config::VpuConfig;
use imx_vdec::decoder::DecodeOutput;
use imx_vdec::decoder::DecodeParams;
use imx_vdec::decoder::FileId;
use imx_vdec::decoder::InitParams;
use imx_vdec::ioctl::dispatch;
use imx_vdec::ioctl::IoStatus;
use imx_vdec::ioctl::VdecRequest;
use imx_vdec::ioctl::VdecResponse;
use imx_vdec::rpc::VpuCommand;
use imx_vdec::rpc::VpuEvent;
use imx_vdec::CodecFormat;

const CLIENT: FileId = FileId(1);

/// Simulated decoding session on the i.MX VPU decoder core
#[derive(Debug, FromArgs)]
struct Args {
    /// codec of the stream. Valid values: h264, h265, mpeg2, mpeg4, vc1, vp8, mjpeg
    #[argh(option, default = "CodecFormat::Avc")]
    codec: CodecFormat,

    /// number of pictures to decode
    #[argh(option, default = "30")]
    frames: u32,

    /// width of the stream
    #[argh(option, default = "640")]
    width: u32,

    /// height of the stream
    #[argh(option, default = "480")]
    height: u32,

    /// number of DPB frames announced in the sequence header
    #[argh(option, default = "4")]
    dpb: u32,

    /// flush the decoder after this many output frames
    #[argh(option)]
    flush_at: Option<u32>,

    /// registry file with Key=Value decoder settings
    #[argh(option)]
    registry: Option<PathBuf>,
}

/// Sequence parameters the simulated firmware announces.
#[derive(Copy, Clone, Debug)]
struct Sequence {
    width: u32,
    height: u32,
    dpb: u32,
}

/// Plays the firmware side: acknowledges session commands, requests frame buffers and decodes one
/// picture per write pointer update.
fn run_firmware(h: DummyHarness, stream: usize, seq: Sequence, quit: &AtomicBool) {
    let mut pictures = 0u32;
    let mut started = false;

    while !quit.load(Ordering::Relaxed) {
        let commands = match h.respond() {
            Ok(commands) => commands,
            Err(e) => {
                log::error!("firmware: {e}");
                return;
            }
        };

        for command in commands.iter().filter(|c| c.stream == stream) {
            match VpuCommand::n(command.id) {
                Some(VpuCommand::Start) if !started => {
                    started = true;
                    let payload = [seq.width, seq.height, seq.dpb, 1];
                    let _ = h.post(stream, VpuEvent::SeqHdrFound, &payload);
                    for _ in 0..seq.dpb + 4 {
                        let _ = h.post(stream, VpuEvent::ReqFrameBuff, &[0]);
                    }
                }
                Some(VpuCommand::UpdateEsWrPtr) => pictures += 1,
                Some(VpuCommand::Abort) => pictures = 0,
                Some(VpuCommand::Stop) => started = false,
                _ => (),
            }
        }

        if pictures > 0 && started {
            if let Some(frame) = h.firmware.take_granted(stream) {
                pictures -= 1;
                let _ = h.post(stream, VpuEvent::PicHdrFound, &[]);
                let _ = h.post(stream, VpuEvent::PicDecoded, &[frame.luma]);
                let _ = h.post(stream, VpuEvent::FrameBuffRdy, &[frame.luma]);
                // Not a reference: give it back right away and ask for another one.
                let _ = h.post(stream, VpuEvent::RelFrameBuff, &[frame.index as u32]);
                let _ = h.post(stream, VpuEvent::ReqFrameBuff, &[0]);
            }
        }

        h.finish_blit(stream);
        thread::sleep(Duration::from_millis(1));
    }
}

fn request(h: &DummyHarness, request: VdecRequest) -> Result<VdecResponse, IoStatus> {
    dispatch(&h.device, CLIENT, request)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let config = match &args.registry {
        Some(path) => {
            let registry = RegistryValues::parse(&fs::read_to_string(path)?);
            VpuConfig::from_registry(&registry)
        }
        None => VpuConfig {
            max_resolution: (args.width, args.height).into(),
            ..Default::default()
        },
    };
    let h = DummyHarness::new(config)?;

    let init = InitParams {
        fourcc: args.codec.fourcc(),
    };
    let stream = match request(&h, VdecRequest::Init(init)) {
        Ok(VdecResponse::Initialized(opened)) => opened.stream,
        other => anyhow::bail!("failed to open stream: {other:?}"),
    };

    let quit = Arc::new(AtomicBool::new(false));
    let firmware = {
        let h = h.clone();
        let quit = quit.clone();
        let seq = Sequence {
            width: args.width,
            height: args.height,
            dpb: args.dpb,
        };
        thread::spawn(move || run_firmware(h, stream, seq, &quit))
    };

    let mut submitted = 0;
    let mut received = 0;
    let mut idle_rounds = 0;
    while received < args.frames && idle_rounds < 100 {
        let eos = submitted == args.frames;
        if !eos {
            h.device.write_bitstream(stream, &mut &[0u8; 256][..])?;
            submitted += 1;
        }

        let params = DecodeParams {
            eos,
            timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let output = match request(&h, VdecRequest::Decode(params)) {
            Ok(VdecResponse::Decoded(output)) => output,
            other => anyhow::bail!("decode failed: {other:?}"),
        };

        match output {
            DecodeOutput::Frame(index) => {
                idle_rounds = 0;
                received += 1;
                if let Ok(VdecResponse::Output(info)) =
                    request(&h, VdecRequest::GetOutput { index })
                {
                    println!(
                        "frame {received}: ofb {index} at {:#x}, {}x{} stride {}",
                        info.phys_addr, info.width, info.height, info.stride
                    );
                }
                if let Err(status) = request(&h, VdecRequest::Clear { index }) {
                    log::warn!("failed to return ofb {index}: {status:?}");
                }

                if args.flush_at == Some(received) {
                    println!("flushing");
                    if let Err(status) = request(&h, VdecRequest::Flush { padding: 0 }) {
                        log::warn!("flush failed: {status:?}");
                    }
                }
            }
            DecodeOutput::EndOfStream => break,
            _ => idle_rounds += 1,
        }
    }

    if let Ok(VdecResponse::Status(status)) = request(&h, VdecRequest::Status) {
        println!("{:#?}", status.counters);
    }

    let closed = request(&h, VdecRequest::Deinit);
    quit.store(true, Ordering::Relaxed);
    if firmware.join().is_err() {
        anyhow::bail!("firmware thread panicked");
    }
    closed.map_err(|status| anyhow::anyhow!("failed to close stream: {status:?}"))?;

    println!("{received} frames decoded");
    Ok(())
}
