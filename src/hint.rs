// Branch prediction hints. The intrinsics are only available on nightly but
// consistently help the probe loops; on stable a cold empty function nudges
// the layout the same way.

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        pub(crate) use core::intrinsics::{likely, unlikely};
    } else {
        #[inline]
        #[cold]
        fn cold() {}

        #[inline]
        pub(crate) fn likely(b: bool) -> bool {
            if !b {
                cold();
            }
            b
        }

        #[inline]
        pub(crate) fn unlikely(b: bool) -> bool {
            if b {
                cold();
            }
            b
        }
    }
}
