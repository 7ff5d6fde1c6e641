use crate::Error;
use bitflags::bitflags;
use libc::pid_t;
use std::fmt;

/// Return value of a failed mmap/mremap syscall (-1 as unsigned).
pub const SYSCALL_FAILED: u64 = u64::MAX;

/// Packed pid-and-tid word attached to every probe record.
///
/// The upper half is the process id, the lower half the thread id. The word
/// is stable across an enter/exit pair of the same syscall, which is what
/// correlation keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn pid(self) -> pid_t {
        (self.0 >> 32) as pid_t
    }

    pub const fn tid(self) -> u32 {
        self.0 as u32
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid(), self.tid())
    }
}

bitflags! {
    /// Flag word of a clone/clone3 enter record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        /// Child shares the parent's address space: a thread, not a new
        /// tracked subject.
        const THREAD = 0x0001_0000;
    }
}

bitflags! {
    /// Flag word of an mremap enter record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RemapFlags: u64 {
        const MAYMOVE = 1;
        const FIXED = 2;
        const DONTUNMAP = 4;
    }
}

impl RemapFlags {
    /// Whether the kernel unmaps the old range for this flag combination.
    pub fn unmaps_old(self) -> bool {
        !(self.contains(Self::MAYMOVE) && self.contains(Self::DONTUNMAP))
    }

    /// Whether the landing range is torn down before the moved mapping is
    /// installed there.
    pub fn unmaps_new(self) -> bool {
        self.contains(Self::MAYMOVE) && !self.contains(Self::DONTUNMAP)
    }
}

/// One decoded probe record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub handle: ThreadHandle,

    /// Kernel-side nanosecond timestamp of the record.
    pub timestamp: u64,

    pub payload: Payload,
}

/// Kind-specific fields of a probe record, decoded once before routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    MmapEnter {
        requested_addr: u64,
        size: u64,
        comm: String,
    },
    MmapExit {
        actual_addr: u64,
    },
    MremapEnter {
        old_addr: u64,
        old_size: u64,
        new_addr: u64,
        new_size: u64,
        flags: RemapFlags,
        comm: String,
    },
    MremapExit {
        new_addr: u64,
    },
    Munmap {
        start_addr: u64,
        size: u64,
        comm: String,
    },
    BrkEnter {
        requested_brk: u64,
        comm: String,
    },
    BrkExit {
        actual_brk: u64,
        comm: String,
    },
    CloneEnter {
        flags: CloneFlags,
        comm: String,
    },
    CloneExit {
        child_pid: pid_t,
    },
    Clone3Enter {
        flags: CloneFlags,
        pidfd: u64,
        child_tid: u64,
        parent_tid: u64,
        comm: String,
    },
    Clone3Exit {
        child_pid: pid_t,
    },
    VforkEnter {
        comm: String,
    },
    VforkExit {
        child_pid: pid_t,
    },
}

impl Payload {
    /// Whether this record belongs to a process-creation syscall.
    pub fn is_process_creation(&self) -> bool {
        matches!(
            self,
            Payload::CloneEnter { .. }
                | Payload::CloneExit { .. }
                | Payload::Clone3Enter { .. }
                | Payload::Clone3Exit { .. }
                | Payload::VforkEnter { .. }
                | Payload::VforkExit { .. }
        )
    }
}

impl Event {
    /// Decode one raw little-endian record as the probes lay it out: a
    /// 24-byte header (kind tag, pid-and-tid word, timestamp), kind-specific
    /// u64 fields, and where present a 16-byte NUL-padded comm.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let kind = read_u64(buf, 0).ok_or(Error::TruncatedEvent {
            kind: 0,
            len: buf.len(),
        })?;
        let truncated = || Error::TruncatedEvent {
            kind,
            len: buf.len(),
        };

        let handle = ThreadHandle::from_raw(read_u64(buf, 8).ok_or_else(truncated)?);
        let timestamp = read_u64(buf, 16).ok_or_else(truncated)?;

        let payload = match kind {
            1 => Payload::MmapEnter {
                requested_addr: read_u64(buf, 24).ok_or_else(truncated)?,
                size: read_u64(buf, 32).ok_or_else(truncated)?,
                comm: read_comm(buf, 40).ok_or_else(truncated)?,
            },
            2 => Payload::MmapExit {
                actual_addr: read_u64(buf, 24).ok_or_else(truncated)?,
            },
            3 => Payload::MremapEnter {
                old_addr: read_u64(buf, 24).ok_or_else(truncated)?,
                old_size: read_u64(buf, 32).ok_or_else(truncated)?,
                new_addr: read_u64(buf, 40).ok_or_else(truncated)?,
                new_size: read_u64(buf, 48).ok_or_else(truncated)?,
                flags: RemapFlags::from_bits_retain(read_u64(buf, 56).ok_or_else(truncated)?),
                comm: read_comm(buf, 64).ok_or_else(truncated)?,
            },
            4 => Payload::MremapExit {
                new_addr: read_u64(buf, 24).ok_or_else(truncated)?,
            },
            5 => Payload::Munmap {
                start_addr: read_u64(buf, 24).ok_or_else(truncated)?,
                size: read_u64(buf, 32).ok_or_else(truncated)?,
                comm: read_comm(buf, 40).ok_or_else(truncated)?,
            },
            6 => Payload::BrkEnter {
                requested_brk: read_u64(buf, 24).ok_or_else(truncated)?,
                comm: read_comm(buf, 32).ok_or_else(truncated)?,
            },
            7 => Payload::BrkExit {
                actual_brk: read_u64(buf, 24).ok_or_else(truncated)?,
                comm: read_comm(buf, 32).ok_or_else(truncated)?,
            },
            8 => Payload::CloneEnter {
                flags: CloneFlags::from_bits_retain(read_u64(buf, 24).ok_or_else(truncated)?),
                comm: read_comm(buf, 32).ok_or_else(truncated)?,
            },
            9 => Payload::CloneExit {
                child_pid: read_u64(buf, 24).ok_or_else(truncated)? as pid_t,
            },
            10 => Payload::Clone3Enter {
                flags: CloneFlags::from_bits_retain(read_u64(buf, 24).ok_or_else(truncated)?),
                pidfd: read_u64(buf, 32).ok_or_else(truncated)?,
                child_tid: read_u64(buf, 40).ok_or_else(truncated)?,
                parent_tid: read_u64(buf, 48).ok_or_else(truncated)?,
                comm: read_comm(buf, 56).ok_or_else(truncated)?,
            },
            11 => Payload::Clone3Exit {
                child_pid: read_u64(buf, 24).ok_or_else(truncated)? as pid_t,
            },
            12 => Payload::VforkEnter {
                comm: read_comm(buf, 24).ok_or_else(truncated)?,
            },
            13 => Payload::VforkExit {
                child_pid: read_u64(buf, 24).ok_or_else(truncated)? as pid_t,
            },
            other => return Err(Error::UnknownEventKind(other)),
        };

        Ok(Self {
            handle,
            timestamp,
            payload,
        })
    }
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_comm(buf: &[u8], at: usize) -> Option<String> {
    let bytes = buf.get(at..at + 16)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(kind: u64, handle: u64, fields: &[u64], comm: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.extend_from_slice(&handle.to_le_bytes());
        buf.extend_from_slice(&42u64.to_le_bytes());
        for field in fields {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        if let Some(comm) = comm {
            let mut bytes = [0u8; 16];
            bytes[..comm.len()].copy_from_slice(comm.as_bytes());
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    #[test]
    fn parses_mmap_enter() {
        let raw = record(1, (7 << 32) | 9, &[0x7f00_0000, 8192], Some("cat"));
        let event = Event::parse(&raw).unwrap();
        assert_eq!(event.handle.pid(), 7);
        assert_eq!(event.handle.tid(), 9);
        assert_eq!(event.timestamp, 42);
        assert_eq!(
            event.payload,
            Payload::MmapEnter {
                requested_addr: 0x7f00_0000,
                size: 8192,
                comm: "cat".into(),
            }
        );
    }

    #[test]
    fn parses_mremap_enter_flags() {
        let raw = record(3, 1 << 32, &[0x1000, 4096, 0, 8192, 5], Some("srv"));
        let event = Event::parse(&raw).unwrap();
        let Payload::MremapEnter { flags, .. } = event.payload else {
            panic!("wrong payload: {:?}", event.payload);
        };
        assert!(flags.contains(RemapFlags::MAYMOVE));
        assert!(flags.contains(RemapFlags::DONTUNMAP));
        assert!(!flags.contains(RemapFlags::FIXED));
    }

    #[test]
    fn parses_clone_exit_child() {
        let raw = record(9, 3 << 32, &[4321], None);
        let event = Event::parse(&raw).unwrap();
        assert_eq!(event.payload, Payload::CloneExit { child_pid: 4321 });
    }

    #[test]
    fn rejects_unknown_kind() {
        let raw = record(99, 1 << 32, &[], None);
        assert!(matches!(
            Event::parse(&raw),
            Err(Error::UnknownEventKind(99))
        ));
    }

    #[test]
    fn rejects_truncated_record() {
        let raw = record(5, 1 << 32, &[0x1000], None);
        assert!(matches!(
            Event::parse(&raw),
            Err(Error::TruncatedEvent { kind: 5, .. })
        ));
    }

    #[test]
    fn comm_stops_at_nul() {
        let raw = record(5, 1 << 32, &[0x1000, 4096], Some("ls"));
        let Payload::Munmap { comm, .. } = Event::parse(&raw).unwrap().payload else {
            panic!("wrong payload");
        };
        assert_eq!(comm, "ls");
    }

    #[test]
    fn remap_flag_matrix() {
        let cases = [
            // (flags, unmaps_old, unmaps_new)
            (RemapFlags::empty(), true, false),
            (RemapFlags::MAYMOVE, true, true),
            (RemapFlags::MAYMOVE | RemapFlags::FIXED, true, true),
            (RemapFlags::MAYMOVE | RemapFlags::DONTUNMAP, false, false),
            (RemapFlags::DONTUNMAP, true, false),
        ];
        for (flags, old, new) in cases {
            assert_eq!(flags.unmaps_old(), old, "{flags:?}");
            assert_eq!(flags.unmaps_new(), new, "{flags:?}");
        }
    }
}
