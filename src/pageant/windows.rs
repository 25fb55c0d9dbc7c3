//! Win32 transport to the agent's Pageant-compatible SSH window.
//!
//! One exchange: create a named file mapping owned by the current user,
//! copy the request in, post a WM_COPYDATA naming the mapping, and read the
//! reply back out of the same mapping. The mapping is unmapped and closed
//! whatever happens; errors are classified by `GetLastError` so the actor
//! can apply its retry policy.

use std::ffi::CString;

use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, HWND, INVALID_HANDLE_VALUE, LPARAM, WPARAM,
    ERROR_INVALID_WINDOW_HANDLE, ERROR_TIMEOUT,
};
use windows::Win32::Security::{
    GetTokenInformation, InitializeSecurityDescriptor, SetSecurityDescriptorOwner, TokenUser,
    PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR, TOKEN_QUERY, TOKEN_USER,
};
use windows::Win32::System::DataExchange::COPYDATASTRUCT;
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_WRITE, PAGE_READWRITE,
};
use windows::Win32::System::SystemServices::SECURITY_DESCRIPTOR_REVISION;
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows::Win32::UI::WindowsAndMessaging::{
    FindWindowW, SendMessageTimeoutW, SMTO_NORMAL, WM_COPYDATA,
};

use super::{AgentWindow, RpcError, MAX_MESSAGE_LEN, SEND_TIMEOUT_MS};

/// Class and title of the agent's SSH window.
const WINDOW_NAME: PCWSTR = windows::core::w!("Pageant");

/// dwData tag the agent expects on the copy-data message.
const COPYDATA_ID: usize = 0x804e_50ba;

/// The agent's window plus the token-user buffer reused for every mapping's
/// security descriptor.
pub struct PageantWindow {
    hwnd: HWND,
    token_user: Vec<u8>,
    counter: u64,
}

// HWND is a process-local identifier, not a thread-affine resource; the
// actor is the only user.
unsafe impl Send for PageantWindow {}

impl PageantWindow {
    /// Find the agent's SSH window and capture the current user's SID for
    /// mapping security descriptors.
    pub fn open() -> Result<Self, RpcError> {
        let hwnd = find_window()?;
        let token_user = current_token_user()?;
        Ok(Self {
            hwnd,
            token_user,
            counter: 0,
        })
    }
}

impl AgentWindow for PageantWindow {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        if request.len() > MAX_MESSAGE_LEN {
            return Err(RpcError::Other(format!(
                "request of {} bytes exceeds the {MAX_MESSAGE_LEN}-byte window protocol limit",
                request.len()
            )));
        }

        self.counter += 1;
        let map_name = format!("gpg-bridge-{}-{}", std::process::id(), self.counter);

        // The mapping unmaps and closes on drop, success or not.
        let mapping = Mapping::create(&map_name, &self.token_user)?;
        mapping.write(request);
        send_copydata(self.hwnd, &map_name)?;
        mapping.read_reply()
    }

    fn reopen(&mut self) -> Result<(), RpcError> {
        self.hwnd = find_window()?;
        debug!("re-resolved agent window");
        Ok(())
    }
}

fn find_window() -> Result<HWND, RpcError> {
    unsafe { FindWindowW(WINDOW_NAME, WINDOW_NAME) }.map_err(|_| RpcError::WindowNotFound)
}

/// Fetch the current process token's TOKEN_USER blob (two-phase sizing).
fn current_token_user() -> Result<Vec<u8>, RpcError> {
    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .map_err(|e| RpcError::Other(format!("OpenProcessToken failed: {e}")))?;

        let mut size = 0u32;
        let _ = GetTokenInformation(token, TokenUser, None, 0, &mut size);
        let mut buf = vec![0u8; size as usize];
        let result = GetTokenInformation(
            token,
            TokenUser,
            Some(buf.as_mut_ptr() as *mut _),
            size,
            &mut size,
        );
        let _ = CloseHandle(token);
        result.map_err(|e| RpcError::Other(format!("GetTokenInformation failed: {e}")))?;
        Ok(buf)
    }
}

fn send_copydata(hwnd: HWND, map_name: &str) -> Result<(), RpcError> {
    let name = CString::new(map_name).expect("mapping name has no interior NUL");
    let cds = COPYDATASTRUCT {
        dwData: COPYDATA_ID,
        // The payload is the ANSI mapping name including its terminator.
        cbData: map_name.len() as u32 + 1,
        lpData: name.as_ptr() as *mut _,
    };

    let mut reply_flag = 0usize;
    let sent = unsafe {
        SendMessageTimeoutW(
            hwnd,
            WM_COPYDATA,
            WPARAM(0),
            LPARAM(&cds as *const COPYDATASTRUCT as isize),
            SMTO_NORMAL,
            SEND_TIMEOUT_MS,
            Some(&mut reply_flag as *mut usize),
        )
    };

    if sent.0 == 0 {
        return Err(match unsafe { GetLastError() } {
            ERROR_TIMEOUT => RpcError::Timeout,
            ERROR_INVALID_WINDOW_HANDLE => RpcError::StaleWindow,
            other => RpcError::Other(format!("SendMessageTimeoutW failed: {}", other.0)),
        });
    }
    if reply_flag == 0 {
        return Err(RpcError::Other("agent rejected the request".to_string()));
    }
    Ok(())
}

/// RAII wrapper for one request/reply mapping.
struct Mapping {
    handle: HANDLE,
    view: *mut u8,
}

impl Mapping {
    fn create(name: &str, token_user: &[u8]) -> Result<Mapping, RpcError> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

        unsafe {
            let mut descriptor = SECURITY_DESCRIPTOR::default();
            let psd = PSECURITY_DESCRIPTOR(&mut descriptor as *mut _ as *mut _);
            InitializeSecurityDescriptor(psd, SECURITY_DESCRIPTOR_REVISION)
                .map_err(|e| RpcError::Other(format!("security descriptor init failed: {e}")))?;
            let user = &*(token_user.as_ptr() as *const TOKEN_USER);
            SetSecurityDescriptorOwner(psd, Some(user.User.Sid), false)
                .map_err(|e| RpcError::Other(format!("security descriptor owner failed: {e}")))?;

            let attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: psd.0,
                bInheritHandle: false.into(),
            };

            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                Some(&attributes as *const SECURITY_ATTRIBUTES),
                PAGE_READWRITE,
                0,
                MAX_MESSAGE_LEN as u32,
                PCWSTR(wide.as_ptr()),
            )
            .map_err(|e| RpcError::Other(format!("CreateFileMappingW failed: {e}")))?;

            let view = MapViewOfFile(handle, FILE_MAP_WRITE, 0, 0, 0);
            if view.Value.is_null() {
                let _ = CloseHandle(handle);
                return Err(RpcError::Other("MapViewOfFile failed".to_string()));
            }

            Ok(Mapping {
                handle,
                view: view.Value as *mut u8,
            })
        }
    }

    fn write(&self, request: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(request.as_ptr(), self.view, request.len());
        }
    }

    /// Reply layout: 4 bytes big-endian payload length, then the payload.
    /// The forwarded bytes are the full `length + 4`.
    fn read_reply(&self) -> Result<Vec<u8>, RpcError> {
        let mut len_bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.view, len_bytes.as_mut_ptr(), 4);
        }
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let total = payload_len + 4;
        if total > MAX_MESSAGE_LEN {
            return Err(RpcError::Other(format!(
                "agent reply of {total} bytes exceeds the mapping"
            )));
        }

        let mut reply = vec![0u8; total];
        unsafe {
            std::ptr::copy_nonoverlapping(self.view, reply.as_mut_ptr(), total);
        }
        Ok(reply)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.view as *mut _,
            });
            let _ = CloseHandle(self.handle);
        }
    }
}
