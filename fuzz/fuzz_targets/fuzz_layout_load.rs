#![no_main]
use libfuzzer_sys::fuzz_target;
use pixelmap::{MountConfig, PixelGrid, PixelMapFs};

// Arbitrary pixel payloads either mount or fail with an error
fuzz_target!(|data: &[u8]| {
    let mut pixels = vec![0u8; 128 * 128 * 4];
    let n = data.len().min(pixels.len());
    pixels[..n].copy_from_slice(&data[..n]);

    let Ok(mut grid) = PixelGrid::from_rgba(128, pixels) else {
        return;
    };
    // Leftover input goes at the end of the Hilbert stream, where a v1 manifest lives
    let rest = &data[n..];
    let tail = rest.len().min(4096);
    if tail > 0 {
        let start = grid.stream_len() - tail as u64;
        if grid.write_stream(start, &rest[..tail]).is_err() {
            return;
        }
    }

    if let Ok(fs) = PixelMapFs::mount_grid(grid, MountConfig::default()) {
        for entry in fs.readdir("/").unwrap_or_default() {
            let _ = fs.read(&entry.name, 4096, 0);
        }
    }
});
