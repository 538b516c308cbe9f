#![no_main]

use imx_vdec::rpc::RpcRing;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let (pointers, mem) = data.split_at(2);
    let mut ring = RpcRing::from_raw(mem, pointers[0] as usize, pointers[1] as usize);

    while !ring.is_empty() {
        let level = ring.level();
        let _ = ring.read_message();
        assert!(ring.level() < level);
    }
});
