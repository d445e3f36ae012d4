//! aya map-value wrappers. The shared structs live in socktrace-common, so
//! the `aya::Pod` marker has to be attached here via newtypes.

use aya::Pod;
use socktrace_common::{
    KernStats, OffsetConfig, OffsetInferState, RelayCommList, SocketInfo, TraceInfo,
};

macro_rules! pod_wrapper {
    ($wrapper:ident, $inner:ty) => {
        #[repr(transparent)]
        #[derive(Copy, Clone)]
        pub struct $wrapper(pub $inner);

        unsafe impl Pod for $wrapper {}
    };
}

pod_wrapper!(OffsetConfigPod, OffsetConfig);
pod_wrapper!(OffsetInferStatePod, OffsetInferState);
pod_wrapper!(SocketInfoPod, SocketInfo);
pod_wrapper!(TraceInfoPod, TraceInfo);
pod_wrapper!(KernStatsPod, KernStats);
pod_wrapper!(RelayCommListPod, RelayCommList);
