//! Binary layout of the records shared with the probes. Integers are native endian.
//!
//! pid_cache (pid -> 88 bytes):
//! cookie u64, ppid u32, pad u32, fork u64, exit u64,
//! uid gid euid egid fsuid fsgid auid u32, pad u32,
//! cap_effective u64, cap_permitted u64, args_id u32, envs_id u32
//!
//! proc_cache (cookie -> 248 bytes):
//! container_id [64], cgroup flags u64, cgroup inode u64, cgroup mount_id u32, pad u32,
//! file fields [56], exec u64, tty [64], comm [16],
//! interpreter inode u64, interpreter mount_id u32, interpreter path_id u32
//!
//! file fields (56 bytes):
//! inode u64, mount_id u32, path_id u32, device u32, flags i32, uid u32, gid u32,
//! nlink u32, mode u16, pad u16, ctime u64, mtime u64

use bpf_common::parsing::StringArray;

use crate::{
    entry::{Credentials, FileFields},
    error::RecordError,
};

pub const PID_RECORD_SIZE: usize = 88;
pub const PROC_RECORD_SIZE: usize = 248;
pub const FILE_FIELDS_SIZE: usize = 56;

pub const CONTAINER_ID_LEN: usize = 64;
pub const TTY_LEN: usize = 64;
pub const COMM_LEN: usize = 16;

pub type PidRecordBytes = [u8; PID_RECORD_SIZE];
pub type ProcRecordBytes = [u8; PROC_RECORD_SIZE];
pub type FileFieldsBytes = [u8; FILE_FIELDS_SIZE];

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(record: &'static str, data: &'a [u8], size: usize) -> Result<Self, RecordError> {
        if data.len() < size {
            return Err(RecordError::Size {
                record,
                expected: size,
                actual: data.len(),
            });
        }
        Ok(Self { data, offset: 0 })
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.bytes())
    }

    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.bytes())
    }

    fn i32(&mut self) -> i32 {
        i32::from_ne_bytes(self.bytes())
    }

    fn u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.bytes())
    }

    fn skip(&mut self, len: usize) {
        self.offset += len;
    }
}

struct Writer<'a> {
    data: &'a mut [u8],
    offset: usize,
}

impl<'a> Writer<'a> {
    fn new(data: &'a mut [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn bytes(&mut self, value: &[u8]) {
        self.data[self.offset..self.offset + value.len()].copy_from_slice(value);
        self.offset += value.len();
    }

    fn u16(&mut self, value: u16) {
        self.bytes(&value.to_ne_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_ne_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.bytes(&value.to_ne_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes(&value.to_ne_bytes());
    }
}

/// Per pid record of the `pid_cache` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidRecord {
    pub cookie: u64,
    pub ppid: u32,
    /// Nanoseconds since boot.
    pub fork_ns: u64,
    pub exit_ns: u64,
    pub credentials: Credentials,
    pub args_id: u32,
    pub envs_id: u32,
}

impl PidRecord {
    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new("pid_cache", data, PID_RECORD_SIZE)?;
        let cookie = r.u64();
        let ppid = r.u32();
        r.skip(4);
        let fork_ns = r.u64();
        let exit_ns = r.u64();
        let credentials = Credentials {
            uid: r.u32(),
            gid: r.u32(),
            euid: r.u32(),
            egid: r.u32(),
            fsuid: r.u32(),
            fsgid: r.u32(),
            auid: r.u32(),
            cap_effective: {
                r.skip(4);
                r.u64()
            },
            cap_permitted: r.u64(),
            ..Default::default()
        };
        Ok(Self {
            cookie,
            ppid,
            fork_ns,
            exit_ns,
            credentials,
            args_id: r.u32(),
            envs_id: r.u32(),
        })
    }

    pub fn encode(&self) -> PidRecordBytes {
        let mut data = [0; PID_RECORD_SIZE];
        let mut w = Writer::new(&mut data);
        w.u64(self.cookie);
        w.u32(self.ppid);
        w.u32(0);
        w.u64(self.fork_ns);
        w.u64(self.exit_ns);
        let c = &self.credentials;
        for id in [c.uid, c.gid, c.euid, c.egid, c.fsuid, c.fsgid, c.auid, 0] {
            w.u32(id);
        }
        w.u64(c.cap_effective);
        w.u64(c.cap_permitted);
        w.u32(self.args_id);
        w.u32(self.envs_id);
        data
    }
}

/// Per image record of the `proc_cache` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcRecord {
    pub container_id: String,
    pub cgroup_flags: u64,
    pub cgroup_inode: u64,
    pub cgroup_mount_id: u32,
    pub file: FileFields,
    /// Nanoseconds since boot.
    pub exec_ns: u64,
    pub tty_name: String,
    pub comm: String,
    pub interpreter_inode: u64,
    pub interpreter_mount_id: u32,
    pub interpreter_path_id: u32,
}

impl ProcRecord {
    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new("proc_cache", data, PROC_RECORD_SIZE)?;
        let container_id = StringArray::<CONTAINER_ID_LEN>::from_bytes(&r.bytes::<CONTAINER_ID_LEN>());
        let cgroup_flags = r.u64();
        let cgroup_inode = r.u64();
        let cgroup_mount_id = r.u32();
        r.skip(4);
        let file = decode_file_fields(&mut r);
        let exec_ns = r.u64();
        let tty_name = StringArray::<TTY_LEN>::from_bytes(&r.bytes::<TTY_LEN>());
        let comm = StringArray::<COMM_LEN>::from_bytes(&r.bytes::<COMM_LEN>());
        Ok(Self {
            container_id: container_id.to_string(),
            cgroup_flags,
            cgroup_inode,
            cgroup_mount_id,
            file,
            exec_ns,
            tty_name: tty_name.to_string(),
            comm: comm.to_string(),
            interpreter_inode: r.u64(),
            interpreter_mount_id: r.u32(),
            interpreter_path_id: r.u32(),
        })
    }

    pub fn encode(&self) -> ProcRecordBytes {
        let mut data = [0; PROC_RECORD_SIZE];
        let mut w = Writer::new(&mut data);
        w.bytes(StringArray::<CONTAINER_ID_LEN>::from(self.container_id.as_str()).as_bytes());
        w.u64(self.cgroup_flags);
        w.u64(self.cgroup_inode);
        w.u32(self.cgroup_mount_id);
        w.u32(0);
        encode_file_fields(&mut w, &self.file);
        w.u64(self.exec_ns);
        w.bytes(StringArray::<TTY_LEN>::from(self.tty_name.as_str()).as_bytes());
        w.bytes(StringArray::<COMM_LEN>::from(self.comm.as_str()).as_bytes());
        w.u64(self.interpreter_inode);
        w.u32(self.interpreter_mount_id);
        w.u32(self.interpreter_path_id);
        data
    }
}

fn decode_file_fields(r: &mut Reader<'_>) -> FileFields {
    let inode = r.u64();
    let mount_id = r.u32();
    let path_id = r.u32();
    let device = r.u32();
    let flags = r.i32();
    let uid = r.u32();
    let gid = r.u32();
    let nlink = r.u32();
    let mode = r.u16();
    r.skip(2);
    FileFields {
        inode,
        mount_id,
        path_id,
        device,
        flags,
        uid,
        gid,
        nlink,
        mode,
        ctime: r.u64(),
        mtime: r.u64(),
    }
}

fn encode_file_fields(w: &mut Writer<'_>, fields: &FileFields) {
    w.u64(fields.inode);
    w.u32(fields.mount_id);
    w.u32(fields.path_id);
    w.u32(fields.device);
    w.i32(fields.flags);
    w.u32(fields.uid);
    w.u32(fields.gid);
    w.u32(fields.nlink);
    w.u16(fields.mode);
    w.u16(0);
    w.u64(fields.ctime);
    w.u64(fields.mtime);
}

pub fn decode_file_fields_record(data: &[u8]) -> Result<FileFields, RecordError> {
    let mut r = Reader::new("inode_file", data, FILE_FIELDS_SIZE)?;
    Ok(decode_file_fields(&mut r))
}

pub fn encode_file_fields_record(fields: &FileFields) -> FileFieldsBytes {
    let mut data = [0; FILE_FIELDS_SIZE];
    encode_file_fields(&mut Writer::new(&mut data), fields);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_record_layout() {
        let record = PidRecord {
            cookie: 0x1122_3344_5566_7788,
            ppid: 1,
            fork_ns: 10,
            exit_ns: 0,
            credentials: Credentials {
                uid: 1000,
                auid: u32::MAX,
                cap_effective: 0x20,
                ..Default::default()
            },
            args_id: 7,
            envs_id: 8,
        };
        let data = record.encode();
        assert_eq!(&data[0..8], &0x1122_3344_5566_7788u64.to_ne_bytes());
        assert_eq!(&data[32..36], &1000u32.to_ne_bytes());
        assert_eq!(&data[56..60], &u32::MAX.to_ne_bytes());
        assert_eq!(&data[64..72], &0x20u64.to_ne_bytes());
        assert_eq!(&data[80..84], &7u32.to_ne_bytes());
        assert_eq!(PidRecord::decode(&data).unwrap(), record);
    }

    #[test]
    fn proc_record_layout() {
        let id = "a".repeat(64);
        let record = ProcRecord {
            container_id: id.clone(),
            cgroup_inode: 99,
            file: FileFields {
                inode: 55,
                mount_id: 3,
                mode: 0o100755,
                mtime: 4,
                ..Default::default()
            },
            exec_ns: 12,
            tty_name: "pts/1".to_owned(),
            comm: "bash".to_owned(),
            interpreter_inode: 66,
            ..Default::default()
        };
        let data = record.encode();
        // a full length container id has no terminator
        assert_eq!(&data[0..64], id.as_bytes());
        assert_eq!(&data[72..80], &99u64.to_ne_bytes());
        assert_eq!(&data[88..96], &55u64.to_ne_bytes());
        assert_eq!(&data[144..152], &12u64.to_ne_bytes());
        assert_eq!(&data[216..220], b"bash");
        assert_eq!(&data[232..240], &66u64.to_ne_bytes());
        assert_eq!(ProcRecord::decode(&data).unwrap(), record);
    }

    #[test]
    fn short_records_are_rejected() {
        assert_eq!(
            PidRecord::decode(&[0; 40]),
            Err(RecordError::Size {
                record: "pid_cache",
                expected: PID_RECORD_SIZE,
                actual: 40
            })
        );
        assert!(ProcRecord::decode(&[0; PID_RECORD_SIZE]).is_err());
        assert!(decode_file_fields_record(&[0; 8]).is_err());
    }
}
