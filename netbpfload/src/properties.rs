//! Android system property access.
//!
//! On non-Android hosts there is no property service; reads fall back to
//! the caller's default and writes are accepted as no-ops so the
//! finalization leg stays harmless under test.

#[cfg(target_os = "android")]
pub fn get_property(name: &str, default: &str) -> String {
    use std::ffi::CString;

    // PROP_VALUE_MAX from <sys/system_properties.h>
    const PROP_VALUE_MAX: usize = 92;

    let Ok(name) = CString::new(name) else {
        return default.to_string();
    };
    let mut value = [0u8; PROP_VALUE_MAX];
    let len = unsafe {
        libc::__system_property_get(name.as_ptr(), value.as_mut_ptr() as *mut libc::c_char)
    };
    if len <= 0 {
        return default.to_string();
    }
    String::from_utf8_lossy(&value[..len as usize]).into_owned()
}

#[cfg(not(target_os = "android"))]
pub fn get_property(_name: &str, default: &str) -> String {
    default.to_string()
}

pub fn get_int_property(name: &str, default: i64) -> i64 {
    get_property(name, "").parse().unwrap_or(default)
}

#[cfg(target_os = "android")]
pub fn set_property(name: &str, value: &str) -> bool {
    use std::ffi::CString;

    let (Ok(name), Ok(value)) = (CString::new(name), CString::new(value)) else {
        return false;
    };
    unsafe { libc::__system_property_set(name.as_ptr(), value.as_ptr()) == 0 }
}

#[cfg(not(target_os = "android"))]
pub fn set_property(name: &str, value: &str) -> bool {
    log::debug!("no property service; ignoring {name}={value}");
    true
}
