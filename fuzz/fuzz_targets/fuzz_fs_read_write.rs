#![no_main]
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};
use pixelmap::{MountConfig, PixelMapFs};

#[derive(Debug, Arbitrary)]
enum FsOp {
    Write { path_idx: u8, offset: u16, data: Vec<u8> },
    Read { path_idx: u8, offset: u16, len: u16 },
    Truncate { path_idx: u8, size: u16 },
    Rename { from: u8, to: u8 },
    Unlink { path_idx: u8 },
    Flush,
}

fn path(idx: u8) -> String {
    format!("/dir{}/file{}", idx % 3, idx % 8)
}

// Random operation sequences must never panic, only return errors
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<FsOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let fs = match PixelMapFs::format(128, MountConfig::read_write()) {
        Ok(fs) => fs,
        Err(_) => return,
    };

    for op in ops.iter().take(64) {
        match op {
            FsOp::Write { path_idx, offset, data } => {
                let _ = fs.write(&path(*path_idx), data, *offset as u64);
            }
            FsOp::Read { path_idx, offset, len } => {
                let _ = fs.read(&path(*path_idx), *len as usize, *offset as u64);
            }
            FsOp::Truncate { path_idx, size } => {
                let _ = fs.truncate(&path(*path_idx), *size as u64);
            }
            FsOp::Rename { from, to } => {
                let _ = fs.rename(&path(*from), &path(*to));
            }
            FsOp::Unlink { path_idx } => {
                let _ = fs.unlink(&path(*path_idx));
            }
            FsOp::Flush => {
                let _ = fs.flush();
            }
        }
    }
    let _ = fs.readdir("/");
    let _ = fs.statfs();
});
