#![no_main]

use imx_vdec::backend::dummy::DummyHarness;
use imx_vdec::config::VpuConfig;
use imx_vdec::decoder::DecodeOutput;
use imx_vdec::decoder::FileId;
use imx_vdec::decoder::InitParams;
use imx_vdec::Fourcc;
use libfuzzer_sys::fuzz_target;

/// Base of the synthetic physical addresses handed out by the host allocator.
const PHYS_BASE: u32 = 0x8000_0000;

// Every four bytes are one event: id, payload shape and two bytes seeding the payload words.
fuzz_target!(|data: &[u8]| {
    let config = VpuConfig {
        max_resolution: (64, 64).into(),
        frame_buffers: 4,
        stream_buff_size: 4096,
        ..Default::default()
    };
    let h = DummyHarness::new(config).unwrap();
    let params = InitParams {
        fourcc: Fourcc::from(b"HEVC"),
    };
    let stream = h.device.open(FileId(1), &params).unwrap().stream;

    for chunk in data.chunks_exact(4) {
        let id = u16::from(chunk[0] & 0x1f);
        let len = u32::from(chunk[1] % 5);
        let addresses = chunk[1] & 0x80 != 0;
        let seed = u32::from(u16::from_le_bytes([chunk[2], chunk[3]]));

        let payload: Vec<u32> = (1..=len)
            .map(|i| {
                let word = seed.wrapping_mul(i);
                if addresses {
                    PHYS_BASE | ((word & 0xff) << 12)
                } else {
                    word % 512
                }
            })
            .collect();

        let _ = h.firmware.post_raw(stream, id, &payload);
        h.pump();
        h.finish_blit(stream);
        h.firmware.drain_commands();

        if let Ok(DecodeOutput::Frame(index)) = h.device.decode(stream, &Default::default()) {
            let _ = h.device.clear_output(stream, index);
        }
    }

    let _ = h.device.status(stream);
});
