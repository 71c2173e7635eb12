use kernel_vmem::VmError;

/// Error numbers returned to userland, negated in the syscall return word.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Errno {
    /// I/O error.
    Io = 5,
    /// Bad file descriptor.
    BadF = 9,
    /// Out of memory.
    NoMem = 12,
    /// Bad address.
    Fault = 14,
    /// Invalid argument.
    Inval = 22,
    /// Function not implemented.
    NoSys = 38,
}

impl Errno {
    /// The negative return-word encoding of this error.
    #[must_use]
    pub const fn as_return_word(self) -> i64 {
        -(self as i32 as i64)
    }
}

impl From<VmError> for Errno {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => Self::NoMem,
            VmError::BadAddress => Self::Fault,
            VmError::InvalidArgument => Self::Inval,
            VmError::BadDescriptor => Self::BadF,
            VmError::NotImplemented => Self::NoSys,
            VmError::Io => Self::Io,
        }
    }
}
