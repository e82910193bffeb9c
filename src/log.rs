/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Print a message (with implicit newline), unconditionally. Use this for the
/// silent-degradation cases spec.md §7 calls for (missing Objective-C
/// sections, missing symbols, missing demangler, a malformed individual
/// line) as well as genuine warnings.
///
/// The message is prefixed with the module path, so it's clear where it came
/// from.
macro_rules! log {
    ($($arg:tt)+) => {
        eprintln!("{}: {}", module_path!(), format_args!($($arg)+));
    }
}

/// Like [log], but prints only if debugging is enabled for the module where
/// it's used. Use for verbose tracing of the simulator/resolver that would
/// otherwise drown out real warnings.
macro_rules! log_dbg {
    ($($arg:tt)+) => {
        if $crate::log::ENABLED_MODULES.contains(&module_path!()) {
            log!($($arg)*);
        }
    }
}

/// Modules to enable [log_dbg] for, e.g. `"mach_annotate::sim"` to see every
/// simulated register write.
pub const ENABLED_MODULES: &[&str] = &[];
