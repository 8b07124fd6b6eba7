pub mod types;

use std::os::raw::{c_char, c_void};

use types::*;

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    /// https://developer.apple.com/documentation/coreservices/1443980-fseventstreamcreate?language=objc
    pub fn FSEventStreamCreate(
        allocator: CFAllocatorRef,
        callback: FSEventStreamCallback,
        context: *const FSEventStreamContext,
        pathsToWatch: CFArrayRef,
        sinceWhen: FSEventStreamId,
        latency: CFTimeInterval,
        flags: FSEventStreamCreateFlags,
    ) -> FSEventStreamRef;

    /// https://developer.apple.com/documentation/coreservices/1448000-fseventstreamstart?language=objc
    pub fn FSEventStreamStart(streamRef: FSEventStreamRef) -> Boolean;

    /// https://developer.apple.com/documentation/coreservices/1447673-fseventstreamstop?language=objc
    pub fn FSEventStreamStop(streamRef: FSEventStreamRef);

    /// https://developer.apple.com/documentation/coreservices/1446990-fseventstreaminvalidate?language=objc
    pub fn FSEventStreamInvalidate(streamRef: FSEventStreamRef);

    /// https://developer.apple.com/documentation/coreservices/1445989-fseventstreamrelease?language=objc
    pub fn FSEventStreamRelease(streamRef: FSEventStreamRef);

    /// https://developer.apple.com/documentation/coreservices/1444164-fseventstreamsetdispatchqueue?language=objc
    pub fn FSEventStreamSetDispatchQueue(streamRef: FSEventStreamRef, q: dispatch_queue_t);
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    pub static kCFTypeArrayCallBacks: CFArrayCallBacks;

    /// https://developer.apple.com/documentation/dispatch/1453030-dispatch_queue_create/
    pub fn dispatch_queue_create(
        label: *const c_char,
        attr: dispatch_queue_attr_t,
    ) -> dispatch_queue_t;

    /// https://developer.apple.com/documentation/dispatch/1496328-dispatch_release
    pub fn dispatch_release(object: dispatch_queue_t);

    /// https://developer.apple.com/documentation/dispatch/1420519-dispatch_time
    pub fn dispatch_time(when: dispatch_time_t, delta: i64) -> dispatch_time_t;

    /// https://developer.apple.com/documentation/dispatch/1452878-dispatch_after_f
    pub fn dispatch_after_f(
        when: dispatch_time_t,
        queue: dispatch_queue_t,
        context: *mut c_void,
        work: dispatch_function_t,
    );

    pub fn CFArrayCreateMutable(
        allocator: CFAllocatorRef,
        capacity: CFIndex,
        callbacks: *const CFArrayCallBacks,
    ) -> CFMutableArrayRef;

    pub fn CFArrayAppendValue(arr: CFMutableArrayRef, element: CFRef);

    pub fn CFRelease(res: CFRef);

    pub fn CFStringCreateWithBytes(
        allocator: CFAllocatorRef,
        bytes: *const u8,
        numBytes: CFIndex,
        encoding: u32,
        isExternalRepresenation: Boolean,
    ) -> CFStringRef;
}

/// Builds a one-element `CFArray` holding `path`. Null on failure.
///
/// # Safety
/// The caller owns the returned array and must `CFRelease` it.
pub unsafe fn path_array(path: &[u8]) -> CFMutableArrayRef {
    let cf_path = CFStringCreateWithBytes(
        kCFAllocatorDefault,
        path.as_ptr(),
        path.len() as CFIndex,
        kCFStringEncodingUTF8,
        false as Boolean,
    );
    if cf_path.is_null() {
        return NULL;
    }

    let paths = CFArrayCreateMutable(kCFAllocatorDefault, 0, &kCFTypeArrayCallBacks);
    if !paths.is_null() {
        CFArrayAppendValue(paths, cf_path);
    }
    CFRelease(cf_path);
    paths
}
