//! Builds an orefs image file, optionally packing host files into the
//! root directory.

use std::{env, fs::File, io, io::Read as _, path::Path, process};

use orefs::{
    device::FileDevice,
    mkfs::{Geometry, ImageBuilder},
};
use orefs_types::NAME_LEN;

fn main() -> io::Result<()> {
    let args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        eprintln!("Usage: {} fs.img [files...]", args[0]);
        process::exit(1);
    }
    let image_file = &args[1];
    let contents = &args[2..];

    let geometry = Geometry::default();
    let device = FileDevice::create(Path::new(image_file), geometry.size as usize)?;
    let mut builder = ImageBuilder::format(&device, &geometry).expect("format failed");

    for name in contents {
        let short = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name);
        if short.len() >= NAME_LEN {
            eprintln!("{short}: name longer than {} bytes", NAME_LEN - 1);
            process::exit(1);
        }

        let mut buf = Vec::new();
        File::open(name)?.read_to_end(&mut buf)?;
        builder
            .add_file(short.as_bytes(), &buf)
            .expect("file too large for the image");
    }

    builder.finish();
    Ok(())
}
