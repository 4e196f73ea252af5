//! Native ADLINK PCI-8102 driver library.
//!
//! The vendor ships the card driver as a shared library (`8102.dll`) with a
//! flat C interface. [`AdlinkLibrary`] loads it at run time from
//! `encoder.library` and exposes it as an [`EncoderDriver`]; the bench binary
//! brings the card up with [`initialize_card`](crate::hardware::encoder::initialize_card)
//! before registering its channels.
//!
//! Without the `instrument_adlink` feature `open` fails with a configuration
//! error and the type cannot be constructed.

use crate::error::{AppResult, DaqError};
use crate::hardware::encoder::EncoderDriver;
use std::path::Path;

#[cfg(feature = "instrument_adlink")]
#[allow(unsafe_code)]
mod native {
    use super::*;
    use libloading::Library;

    type Initial = unsafe extern "system" fn(*mut u16, i16) -> i16;
    type ConfigFromFile = unsafe extern "system" fn() -> i16;
    type SetPosition = unsafe extern "system" fn(i16, f64) -> i16;
    type GetPosition = unsafe extern "system" fn(i16, *mut f64) -> i16;
    type SetMotionIntFactor = unsafe extern "system" fn(i16, u32) -> i16;
    type SetTriggerComparator = unsafe extern "system" fn(i16, i16, i16, i32) -> i16;
    type IntControl = unsafe extern "system" fn(i16, i16) -> i16;
    type WaitMotionInterrupt = unsafe extern "system" fn(i16, i16, i32) -> i16;

    /// Function table resolved from the vendor library.
    ///
    /// The function pointers stay valid while `_library` is loaded.
    pub struct AdlinkLibrary {
        initial: Initial,
        config_from_file: ConfigFromFile,
        set_position: SetPosition,
        get_position: GetPosition,
        set_motion_int_factor: SetMotionIntFactor,
        set_trigger_comparator: SetTriggerComparator,
        int_control: IntControl,
        wait_motion_interrupt: WaitMotionInterrupt,
        _library: Library,
    }

    /// # Safety
    /// `T` must be the function pointer type of the exported symbol.
    unsafe fn symbol<T: Copy>(library: &Library, path: &Path, name: &str) -> AppResult<T> {
        let mut raw = name.as_bytes().to_vec();
        raw.push(0);
        library.get::<T>(&raw).map(|s| *s).map_err(|e| {
            DaqError::Configuration(format!(
                "'{}' does not export {}: {}",
                path.display(),
                name,
                e
            ))
        })
    }

    impl AdlinkLibrary {
        /// Load the driver library and resolve every function the encoder uses.
        pub fn open(path: &Path) -> AppResult<Self> {
            // SAFETY: loading runs the library's initialisers, which only set up
            // the driver's own state.
            let library = unsafe { Library::new(path) }.map_err(|e| {
                DaqError::Configuration(format!(
                    "cannot load encoder driver '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            // SAFETY: the pointer types match the prototypes in the vendor's 8102.h.
            let table = unsafe {
                Self {
                    initial: symbol(&library, path, "_8102_initial")?,
                    config_from_file: symbol(&library, path, "_8102_config_from_file")?,
                    set_position: symbol(&library, path, "_8102_set_position")?,
                    get_position: symbol(&library, path, "_8102_get_position")?,
                    set_motion_int_factor: symbol(&library, path, "_8102_set_motion_int_factor")?,
                    set_trigger_comparator: symbol(&library, path, "_8102_set_trigger_comparator")?,
                    int_control: symbol(&library, path, "_8102_int_control")?,
                    wait_motion_interrupt: symbol(&library, path, "_8102_wait_motion_interrupt")?,
                    _library: library,
                }
            };
            tracing::info!("Loaded encoder driver '{}'", path.display());
            Ok(table)
        }
    }

    // SAFETY (all calls below): the pointers were resolved with matching
    // prototypes and the library outlives `self`; out-pointers come from live
    // references.
    impl EncoderDriver for AdlinkLibrary {
        fn initial(&self, card_id_inbit: &mut u16, manual_id: i16) -> i16 {
            unsafe { (self.initial)(card_id_inbit, manual_id) }
        }

        fn config_from_file(&self) -> i16 {
            unsafe { (self.config_from_file)() }
        }

        fn set_position(&self, axis: i16, position: f64) -> i16 {
            unsafe { (self.set_position)(axis, position) }
        }

        fn get_position(&self, axis: i16, position: &mut f64) -> i16 {
            unsafe { (self.get_position)(axis, position) }
        }

        fn set_motion_int_factor(&self, axis: i16, factor: u32) -> i16 {
            unsafe { (self.set_motion_int_factor)(axis, factor) }
        }

        fn set_trigger_comparator(&self, axis: i16, source: i16, method: i16, data: i32) -> i16 {
            unsafe { (self.set_trigger_comparator)(axis, source, method, data) }
        }

        fn int_control(&self, card: i16, enable: i16) -> i16 {
            unsafe { (self.int_control)(card, enable) }
        }

        fn wait_motion_interrupt(&self, axis: i16, factor_bit: i16, timeout_ms: i32) -> i16 {
            unsafe { (self.wait_motion_interrupt)(axis, factor_bit, timeout_ms) }
        }
    }
}

#[cfg(not(feature = "instrument_adlink"))]
mod native {
    use super::*;

    enum Unavailable {}

    /// Encoder driver library; compiled out.
    pub struct AdlinkLibrary(Unavailable);

    impl AdlinkLibrary {
        /// Always fails: built without `instrument_adlink`.
        pub fn open(path: &Path) -> AppResult<Self> {
            Err(DaqError::Configuration(format!(
                "cannot load encoder driver '{}': built without the instrument_adlink feature",
                path.display()
            )))
        }
    }

    impl EncoderDriver for AdlinkLibrary {
        fn initial(&self, _card_id_inbit: &mut u16, _manual_id: i16) -> i16 {
            match self.0 {}
        }

        fn config_from_file(&self) -> i16 {
            match self.0 {}
        }

        fn set_position(&self, _axis: i16, _position: f64) -> i16 {
            match self.0 {}
        }

        fn get_position(&self, _axis: i16, _position: &mut f64) -> i16 {
            match self.0 {}
        }

        fn set_motion_int_factor(&self, _axis: i16, _factor: u32) -> i16 {
            match self.0 {}
        }

        fn set_trigger_comparator(&self, _axis: i16, _source: i16, _method: i16, _data: i32) -> i16 {
            match self.0 {}
        }

        fn int_control(&self, _card: i16, _enable: i16) -> i16 {
            match self.0 {}
        }

        fn wait_motion_interrupt(&self, _axis: i16, _factor_bit: i16, _timeout_ms: i32) -> i16 {
            match self.0 {}
        }
    }
}

pub use native::AdlinkLibrary;
