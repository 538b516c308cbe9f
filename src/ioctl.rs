// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client request marshalling.
//!
//! Each client file drives at most one stream. [`dispatch`] maps a request to the matching
//! [`VpuDevice`] operation and every failure to the status code returned to the client.

use enumn::N;

use crate::decoder::DecodeOutput;
use crate::decoder::DecodeParams;
use crate::decoder::FatalError;
use crate::decoder::FileId;
use crate::decoder::InitParams;
use crate::decoder::OpenedStream;
use crate::decoder::OutputFrameInfo;
use crate::decoder::StreamStatus;
use crate::decoder::VdecError;
use crate::decoder::VpuDevice;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VdecRequest {
    Init(InitParams),
    Deinit,
    Decode(DecodeParams),
    Status,
    Flush { padding: u32 },
    Clear { index: usize },
    GetOutput { index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VdecResponse {
    Initialized(OpenedStream),
    Deinitialized,
    Decoded(DecodeOutput),
    Status(StreamStatus),
    Flushed,
    Cleared,
    Output(OutputFrameInfo),
}

/// Completion status of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum IoStatus {
    Success = 0,
    Unsuccessful = 0xc000_0001,
    InvalidHandle = 0xc000_0008,
    InvalidParameter = 0xc000_000d,
    InsufficientResources = 0xc000_009a,
    IoTimeout = 0xc000_00b5,
    RangeNotFound = 0xc000_028c,
    DeviceHardwareError = 0xc000_0483,
}

impl IoStatus {
    pub fn is_success(self) -> bool {
        self == IoStatus::Success
    }
}

impl From<&VdecError> for IoStatus {
    fn from(err: &VdecError) -> Self {
        match err {
            VdecError::NoFreeContext | VdecError::UnsupportedFormat(_) => IoStatus::Unsuccessful,
            VdecError::InsufficientResources(_) => IoStatus::InsufficientResources,
            VdecError::RangeNotFound(_) => IoStatus::RangeNotFound,
            VdecError::InvalidStream(_) => IoStatus::InvalidHandle,
            VdecError::InvalidWritePointer(_) => IoStatus::InvalidParameter,
            VdecError::Fatal(FatalError::FirmwareException(_)) => IoStatus::DeviceHardwareError,
            VdecError::Fatal(_) => IoStatus::Unsuccessful,
            VdecError::Timeout => IoStatus::IoTimeout,
            VdecError::Other(_) => IoStatus::Unsuccessful,
        }
    }
}

/// Runs `request` on behalf of `file`.
pub fn dispatch(
    device: &VpuDevice,
    file: FileId,
    request: VdecRequest,
) -> Result<VdecResponse, IoStatus> {
    let stream = device.stream_for_file(file);

    let result = match (request, stream) {
        (VdecRequest::Init(params), None) => {
            device.open(file, &params).map(VdecResponse::Initialized)
        }
        (VdecRequest::Init(_), Some(stream)) => {
            log::warn!("{file:?} already drives stream {stream}");
            return Err(IoStatus::Unsuccessful);
        }
        (_, None) => {
            log::debug!("{file:?} has no stream");
            return Err(IoStatus::InvalidHandle);
        }
        (VdecRequest::Deinit, Some(stream)) => {
            device.close(stream).map(|()| VdecResponse::Deinitialized)
        }
        (VdecRequest::Decode(params), Some(stream)) => {
            device.decode(stream, &params).map(VdecResponse::Decoded)
        }
        (VdecRequest::Status, Some(stream)) => device.status(stream).map(VdecResponse::Status),
        (VdecRequest::Flush { padding }, Some(stream)) => {
            device.flush(stream, padding).map(|()| VdecResponse::Flushed)
        }
        (VdecRequest::Clear { index }, Some(stream)) => {
            device.clear_output(stream, index).map(|()| VdecResponse::Cleared)
        }
        (VdecRequest::GetOutput { index }, Some(stream)) => {
            device.get_output(stream, index).map(VdecResponse::Output)
        }
    };

    result.map_err(|e| {
        let status = IoStatus::from(&e);
        log::debug!("{file:?}: request failed with {status:?}: {e:#}");
        status
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyHarness;
    use crate::decoder::tests::configure;
    use crate::decoder::tests::decode_picture;
    use crate::decoder::tests::h264;
    use crate::decoder::tests::harness;
    use crate::decoder::tests::respond_once;
    use crate::decoder::tests::TEST_FILE;
    use crate::rpc::VpuCommand;
    use crate::rpc::VpuEvent;
    use crate::Fourcc;

    fn init(h: &DummyHarness, file: FileId) -> usize {
        match dispatch(&h.device, file, VdecRequest::Init(h264())) {
            Ok(VdecResponse::Initialized(opened)) => opened.stream,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_codes() {
        assert_eq!(IoStatus::n(0xc000_028c), Some(IoStatus::RangeNotFound));
        assert_eq!(IoStatus::n(0x1234), None);
        assert!(IoStatus::Success.is_success());
        assert_eq!(
            IoStatus::from(&VdecError::Fatal(FatalError::FirmwareException(1))),
            IoStatus::DeviceHardwareError
        );
        assert_eq!(
            IoStatus::from(&VdecError::Fatal(FatalError::ZeroResolution)),
            IoStatus::Unsuccessful
        );
        assert_eq!(IoStatus::from(&VdecError::Timeout), IoStatus::IoTimeout);
    }

    #[test]
    fn requests_need_an_open_stream() {
        let h = harness();
        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Status),
            Err(IoStatus::InvalidHandle)
        );
        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Deinit),
            Err(IoStatus::InvalidHandle)
        );
    }

    #[test]
    fn init_once_per_file() {
        let h = harness();
        init(&h, TEST_FILE);
        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Init(h264())),
            Err(IoStatus::Unsuccessful)
        );

        let params = InitParams {
            fourcc: Fourcc::from(b"ABCD"),
        };
        assert_eq!(
            dispatch(&h.device, FileId(2), VdecRequest::Init(params)),
            Err(IoStatus::Unsuccessful)
        );

        init(&h, FileId(2));
        assert_eq!(
            dispatch(&h.device, FileId(3), VdecRequest::Init(h264())),
            Err(IoStatus::Unsuccessful)
        );

        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Deinit),
            Ok(VdecResponse::Deinitialized)
        );
        init(&h, FileId(3));
    }

    #[test]
    fn output_round_trip() {
        let h = harness();
        let stream = init(&h, TEST_FILE);
        h.device
            .write_bitstream(stream, &mut &[0u8; 32][..])
            .unwrap();

        let responder = respond_once(&h, stream, VpuCommand::Start, VpuEvent::StartDone);
        let decode = VdecRequest::Decode(Default::default());
        assert_eq!(
            dispatch(&h.device, TEST_FILE, decode.clone()),
            Ok(VdecResponse::Decoded(DecodeOutput::NoOutput))
        );
        responder.join().unwrap();

        configure(&h, stream, 2);
        decode_picture(&h, stream);
        h.finish_blit(stream).unwrap();

        let Ok(VdecResponse::Decoded(DecodeOutput::Frame(index))) =
            dispatch(&h.device, TEST_FILE, decode)
        else {
            panic!("expected a frame");
        };

        let Ok(VdecResponse::Output(info)) =
            dispatch(&h.device, TEST_FILE, VdecRequest::GetOutput { index })
        else {
            panic!("expected output info");
        };
        assert_eq!(info.index, index);
        assert_eq!((info.width, info.height, info.stride), (320, 240, 1280));

        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Clear { index: 99 }),
            Err(IoStatus::RangeNotFound)
        );
        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Clear { index }),
            Ok(VdecResponse::Cleared)
        );

        let Ok(VdecResponse::Status(status)) =
            dispatch(&h.device, TEST_FILE, VdecRequest::Status)
        else {
            panic!("expected a status");
        };
        assert_eq!(status.fbl.ofb_free, status.fbl.ofb_capacity);
    }

    #[test]
    fn fatal_stream_reports_hardware_error() {
        let h = harness();
        let stream = init(&h, TEST_FILE);
        h.post(stream, VpuEvent::FirmwareXcpt, &[7]).unwrap();
        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Decode(Default::default())),
            Err(IoStatus::DeviceHardwareError)
        );
        // Flushing a stopped stream does nothing.
        assert_eq!(
            dispatch(&h.device, TEST_FILE, VdecRequest::Flush { padding: 0 }),
            Ok(VdecResponse::Flushed)
        );
    }
}
