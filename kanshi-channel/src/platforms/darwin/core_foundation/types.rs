#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(dead_code)]

use bitflags::bitflags;
use std::os::raw::{c_char, c_long, c_uchar, c_uint, c_void};

//
// MacOS CoreFoundation types
//
pub type Boolean = c_uchar;

pub type CFRef = *mut c_void;
pub type CFStringRef = CFRef;
pub type CFArrayRef = CFRef;
pub type CFAllocatorRef = CFRef;
pub type CFMutableArrayRef = CFRef;
pub type CFIndex = c_long;
pub type CFTimeInterval = f64;
pub type CFArrayRetainCallBack = extern "C" fn(CFAllocatorRef, *const c_void) -> *const c_void;
pub type CFArrayReleaseCallBack = extern "C" fn(CFAllocatorRef, *const c_void);
pub type CFArrayCopyDescriptionCallBack = extern "C" fn(*const c_void) -> CFStringRef;
pub type CFArrayEqualCallBack = extern "C" fn(*const c_void, *const c_void) -> Boolean;

#[repr(C)]
pub struct CFArrayCallBacks {
    version: CFIndex,
    retain: Option<CFArrayRetainCallBack>,
    release: Option<CFArrayReleaseCallBack>,
    cp: Option<CFArrayCopyDescriptionCallBack>,
    equal: Option<CFArrayEqualCallBack>,
}

pub const NULL: CFRef = 0 as CFRef;
pub const kCFAllocatorDefault: CFAllocatorRef = NULL;
pub const kCFStringEncodingUTF8: u32 = 0x08000100;

//
// MacOS DispatchQueue types
//
pub type dispatch_object_s = c_void;
pub type dispatch_queue_t = *mut dispatch_object_s;
pub type dispatch_queue_attr_t = *const dispatch_object_s;
pub const DISPATCH_QUEUE_SERIAL: dispatch_queue_attr_t = 0 as dispatch_queue_attr_t;
pub type dispatch_time_t = u64;
pub type dispatch_function_t = extern "C" fn(*mut c_void);
pub const DISPATCH_TIME_NOW: dispatch_time_t = 0;

//
// MacOS FSEvents types
//
pub type FSEventStreamRef = CFRef;
pub type FSEventStreamId = u64;
pub type FSEventStreamCallback = extern "C" fn(
    FSEventStreamRef,               // ConstFSEventStreamRef - the stream this event originated from
    *mut c_void,                    // FSEventStreamContext->info
    usize,                          // numEvents
    *const *const c_char,           // eventPaths - C strings, as kFSEventStreamCreateFlagUseCFTypes is not set
    *const FSEventStreamEventFlags, // eventFlags - one per event
    *const FSEventStreamId,         // eventIds - always increasing
);

pub type FSEventContextRetain = extern "C" fn(*const c_void) -> *const c_void;
pub type FSEventContextRelease = extern "C" fn(*const c_void);
pub type FSEventContextCopyDescription = extern "C" fn(*const c_void) -> CFStringRef;

pub const kFSEventStreamEventIdSinceNow: FSEventStreamId = u64::MAX;

#[repr(C)]
pub struct FSEventStreamContext {
    pub version: CFIndex,
    pub info: *mut c_void,
    pub retain: Option<FSEventContextRetain>,
    pub release: Option<FSEventContextRelease>,
    pub copy_description: Option<FSEventContextCopyDescription>,
}

bitflags! {
  #[repr(transparent)]
  #[derive(Clone, Copy, Debug)]
  pub struct FSEventStreamCreateFlags: c_uint {
    const kFSEventStreamCreateFlagNone = 0x00000000;
    const kFSEventStreamCreateFlagNoDefer = 0x00000002;
    const kFSEventStreamCreateFlagWatchRoot = 0x00000004;
    const kFSEventStreamCreateFlagIgnoreSelf = 0x00000008;
    const kFSEventStreamCreateFlagFileEvents = 0x00000010;
  }
}

bitflags! {
  #[repr(transparent)]
  #[derive(Clone, Copy, Debug)]
  pub struct FSEventStreamEventFlags: c_uint {
    const kFSEventStreamEventFlagNone = 0x00000000;
    const kFSEventStreamEventFlagMustScanSubDirs = 0x00000001;
    const kFSEventStreamEventFlagUserDropped = 0x00000002;
    const kFSEventStreamEventFlagKernelDropped = 0x00000004;
    const kFSEventStreamEventFlagEventIdsWrapped = 0x00000008;
    const kFSEventStreamEventFlagHistoryDone = 0x00000010;
    const kFSEventStreamEventFlagRootChanged = 0x00000020;
    const kFSEventStreamEventFlagMount = 0x00000040;
    const kFSEventStreamEventFlagUnmount = 0x00000080;
    const kFSEventStreamEventFlagItemCreated = 0x00000100;
    const kFSEventStreamEventFlagItemRemoved = 0x00000200;
    const kFSEventStreamEventFlagItemInodeMetaMod = 0x00000400;
    const kFSEventStreamEventFlagItemRenamed = 0x00000800;
    const kFSEventStreamEventFlagItemModified = 0x00001000;
    const kFSEventStreamEventFlagItemFinderInfoMod = 0x00002000;
    const kFSEventStreamEventFlagItemChangeOwner = 0x00004000;
    const kFSEventStreamEventFlagItemXattrMod = 0x00008000;
    const kFSEventStreamEventFlagItemIsFile = 0x00010000;
    const kFSEventStreamEventFlagItemIsDir = 0x00020000;
    const kFSEventStreamEventFlagItemIsSymlink = 0x00040000;
    const kFSEventStreamEventFlagOwnEvent = 0x00080000;
    const kFSEventStreamEventFlagItemIsHardlink = 0x00100000;
    const kFSEventStreamEventFlagItemIsLastHardlink = 0x00200000;
    const kFSEventStreamEventFlagItemCloned = 0x00400000;
  }
}
