use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::io::{Read, Write};

// only the files that shape a serialized CodeUnit contribute to its fingerprint
const INCLUDES: &[&str] = &[
    "Cargo.toml",
    "src/opcode.rs",
    "src/bytecode.rs",
    "src/runtime.rs",
];

fn main() {
    let paths: BTreeSet<&str> = INCLUDES.iter().copied().collect();

    let mut context = md5::Context::new();
    let mut buf = Vec::with_capacity(64 * 1024);
    for path in paths {
        println!("cargo:rerun-if-changed={path}");
        buf.clear();
        File::open(path).unwrap().read_to_end(&mut buf).unwrap();
        context.consume(path.as_bytes());
        context.consume(&buf);
    }
    let digest = context.compute().0;
    let hash = u64::from_be_bytes(digest[..8].try_into().unwrap());

    let out_dir = std::env::var("OUT_DIR").unwrap();
    fs::create_dir_all(&out_dir).unwrap();
    let mut f = BufWriter::new(File::create(format!("{out_dir}/meta.rs")).unwrap());
    writeln!(f, "pub const FINGERPRINT: u64 = 0x{hash:0>16x}u64;").unwrap();
}
