//! Fixed capacity storage for a native socket address.

/// Capacity of the address storage, matching `sockaddr_storage`.
pub const STORAGE_LEN: usize = 128;

/// A native socket address held in a fixed size buffer together with its logical length.
///
/// The buffer is zero-initialised and the logical length never exceeds [`STORAGE_LEN`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    storage: [u8; STORAGE_LEN],
    len: usize,
}

impl Endpoint {
    /// Copy `data` into a new endpoint, truncating it to [`STORAGE_LEN`] bytes.
    pub fn new(data: &[u8]) -> Self {
        let len = data.len().min(STORAGE_LEN);
        let mut storage = [0u8; STORAGE_LEN];
        storage[..len].copy_from_slice(&data[..len]);
        Self { storage, len }
    }

    pub fn storage(&self) -> &[u8; STORAGE_LEN] {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut [u8; STORAGE_LEN] {
        &mut self.storage
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        STORAGE_LEN
    }

    /// Set the logical length after the storage was filled in place, e.g. by `accept(2)`.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(STORAGE_LEN);
    }
}

/// An endpoint spanning the whole storage, ready to be filled by the operating system.
impl Default for Endpoint {
    fn default() -> Self {
        Self {
            storage: [0u8; STORAGE_LEN],
            len: STORAGE_LEN,
        }
    }
}

impl<T: AsRef<[u8]> + ?Sized> From<&T> for Endpoint {
    fn from(value: &T) -> Self {
        Self::new(value.as_ref())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("len", &self.len)
            .field("data", &self.as_bytes())
            .finish()
    }
}
