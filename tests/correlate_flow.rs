//! End-to-end correlation over synthetic ARMv5 binaries on disk.

use arm5_correlate::{
    correlate_files, correlate_symbols, CorrelateOptions, MappedBinary, Segment,
    SymbolMatchOptions,
};
use pretty_assertions::assert_eq;
use std::io::Write;

/// mov rN, rN filler word; distinct per register, relocation-proof.
fn mov(reg: u8) -> [u8; 4] {
    [0x00, reg, 0xA0, 0xE1]
}

/// bl with a 24-bit offset.
fn bl(offset: u32) -> [u8; 4] {
    let [b0, b1, b2, _] = offset.to_le_bytes();
    [b0, b1, b2, 0xEB]
}

/// ldr r1, [pc, #offset].
fn ldr_pc(offset: u8) -> [u8; 4] {
    [offset, 0x10, 0x9F, 0xE5]
}

fn write_temp(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn test_correlate_files_tolerates_relocated_offsets() {
    let dir = tempfile::tempdir().unwrap();

    let mut source = Vec::new();
    for reg in [1, 2, 3] {
        source.extend(mov(reg));
    }
    source.extend(bl(0x001234));
    source.extend(ldr_pc(0x04));
    for reg in [4, 5, 6] {
        source.extend(mov(reg));
    }

    // The target carries the same code 12 bytes in, with the bl and
    // ldr offsets relocated
    let mut target = Vec::new();
    for reg in [9, 10, 11] {
        target.extend(mov(reg));
    }
    for reg in [1, 2, 3] {
        target.extend(mov(reg));
    }
    target.extend(bl(0x00ABCD));
    target.extend(ldr_pc(0x0C));
    for reg in [4, 5, 6] {
        target.extend(mov(reg));
    }

    let source_path = write_temp(&dir, "source.bin", &source);
    let target_path = write_temp(&dir, "target.bin", &target);

    let options = CorrelateOptions {
        chunk_size: 2,
        ..CorrelateOptions::new()
    };
    let outcome =
        correlate_files(&source_path, &[&target_path], 0, None, &options).unwrap();

    // The whole source is one merged run, shifted by 12 bytes
    assert_eq!(
        outcome.selection.correlations,
        vec![(
            Segment { offset: 0, length: 32 },
            vec![(0, vec![Segment { offset: 12, length: 32 }])]
        )]
    );
    assert!(outcome.selection.interpolated.is_empty());
}

#[test]
fn test_correlate_files_strict_offsets_miss() {
    let dir = tempfile::tempdir().unwrap();

    let mut source = mov(1).to_vec();
    source.extend(ldr_pc(0x04));
    let mut target = mov(1).to_vec();
    target.extend(ldr_pc(0x08));

    let source_path = write_temp(&dir, "source.bin", &source);
    let target_path = write_temp(&dir, "target.bin", &target);

    let strict = CorrelateOptions {
        chunk_size: 2,
        mask: Default::default(),
        ..CorrelateOptions::new()
    };
    let outcome = correlate_files(&source_path, &[&target_path], 0, None, &strict).unwrap();
    // One uncovered hole spanning the scan range
    assert_eq!(
        outcome.selection.correlations,
        vec![(Segment { offset: 0, length: 8 }, vec![])]
    );
}

#[test]
fn test_missing_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = write_temp(&dir, "source.bin", &mov(1));
    let missing = dir.path().join("missing.bin");
    assert!(
        correlate_files(&source_path, &[&missing], 0, None, &CorrelateOptions::new()).is_err()
    );
}

#[test]
fn test_xmap_symbol_correlation_end_to_end() {
    let dir = tempfile::tempdir().unwrap();

    // Source binary: one function (code + literal pool), then filler
    let mut source_bin = Vec::new();
    source_bin.extend(mov(1));
    source_bin.extend(bl(0x000100));
    source_bin.extend([0x78, 0x56, 0x34, 0x12]); // literal pool
    source_bin.extend(mov(7));

    let mut source_map = Vec::new();
    writeln!(source_map, "# .main").unwrap();
    writeln!(source_map, "#>02000000 START (linker command file)").unwrap();
    writeln!(source_map, "02000000 00000000 .main $a (game.o)").unwrap();
    writeln!(source_map, "02000000 0000000C .main do_thing (game.o)").unwrap();
    writeln!(source_map, "02000008 00000000 .main $d (game.o)").unwrap();
    writeln!(source_map, "0200000C 00000000 .main $a (game.o)").unwrap();
    writeln!(source_map, "0200000C 00000004 .main filler (game.o)").unwrap();
    writeln!(source_map, "02000010 00000000 .main $a (game.o)").unwrap();

    // Target binary: the same function 8 bytes in, bl relocated,
    // pool identical
    let mut target_bin = Vec::new();
    target_bin.extend(mov(8));
    target_bin.extend(mov(9));
    target_bin.extend(mov(1));
    target_bin.extend(bl(0x000777));
    target_bin.extend([0x78, 0x56, 0x34, 0x12]);

    let mut target_map = Vec::new();
    writeln!(target_map, "# .main").unwrap();
    writeln!(target_map, "#>02100000 START (linker command file)").unwrap();
    writeln!(target_map, "02100008 00000000 .main $a (game.o)").unwrap();
    writeln!(target_map, "02100008 0000000C .main sub_02100008 (game.o)").unwrap();
    writeln!(target_map, "02100010 00000000 .main $d (game.o)").unwrap();
    writeln!(target_map, "02100014 00000000 .main $a (game.o)").unwrap();
    writeln!(target_map, "02100014 00000000 .main end_marker (game.o)").unwrap();

    let source_bin_path = write_temp(&dir, "source.bin", &source_bin);
    let source_map_path = write_temp(&dir, "source.xMAP", &source_map);
    let target_bin_path = write_temp(&dir, "target.bin", &target_bin);
    let target_map_path = write_temp(&dir, "target.xMAP", &target_map);

    let source =
        MappedBinary::load_with_xmap(&source_bin_path, &source_map_path, ".main").unwrap();
    let target =
        MappedBinary::load_with_xmap(&target_bin_path, &target_map_path, ".main").unwrap();
    assert_eq!(source.load_address(), 0x0200_0000);
    assert_eq!(source.symbols().len(), 2);

    let options = SymbolMatchOptions {
        min_length: 8,
        ..SymbolMatchOptions::new()
    };
    let results = correlate_symbols(&source, &target, &options).unwrap();

    // `filler` is below min_length; `do_thing` matches the relocated
    // copy, resolved to the pre-existing target symbol
    assert_eq!(results.len(), 1);
    let (symbol, matches) = &results[0];
    assert_eq!(symbol.name, "do_thing");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].address, 0x0210_0008);
    assert_eq!(matches[0].length, 12);
    assert!(!matches[0].data_pool_mismatch);
    assert_eq!(
        matches[0].symbol.as_ref().map(|s| s.name.as_str()),
        Some("sub_02100008")
    );
}
