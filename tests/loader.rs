//! End-to-end pipeline tests: synthetic objects loaded against the
//! scripted platform, asserting on the kernel calls and the pin
//! namespace they leave behind.

use byteorder::{ByteOrder, LittleEndian};
use std::path::PathBuf;

use netbpfload::ebpf;
use netbpfload::env::{kver, Arch, BuildType, EnvSnapshot};
use netbpfload::loader::{load_dir, load_object, Location};
use netbpfload::LoadError;
use test_utils::{
    encode_map_def, encode_prog_def, ld_map_fd_prog, le32, MapDefSpec, ObjBuilder, ProgDefSpec,
    TestPlatform,
};

const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

const LOCATION: Location = Location {
    dir: "/nonexistent",
    prefix: "",
};

fn env_on(kernel_ver: u32) -> EnvSnapshot {
    EnvSnapshot {
        kernel_ver,
        loader_ver: 42,
        build_type: BuildType::User,
        arch: Arch::Aarch64,
        userspace_64bit: true,
        running_as_root: true,
        page_size: 4096,
    }
}

fn write_obj(dir: &tempfile::TempDir, name: &str, image: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, image).expect("failed to write object");
    path
}

/// One hash map `m` plus one `cgroupskb/prog1` program with a
/// relocation against `m` at instruction 0.
fn single_prog_single_map(map: &MapDefSpec, prog: &ProgDefSpec) -> Vec<u8> {
    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("maps", &encode_map_def(map))
        .symbol("m", "maps", STT_OBJECT, 0)
        .section("cgroupskb/prog1", &ld_map_fd_prog())
        .symbol("prog1", "cgroupskb/prog1", STT_FUNC, 0)
        .rel("cgroupskb/prog1", &[(0, "m")])
        .section("progs", &encode_prog_def(prog))
        .symbol("prog1_def", "progs", STT_OBJECT, 0)
        .section("size_of_bpf_map_def", &le32(128))
        .section("size_of_bpf_prog_def", &le32(100));
    b.build()
}

#[test]
fn realizes_map_and_program_end_to_end() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        min_kver: kver(4, 9, 0),
        uid: 1000,
        gid: 3003,
        ..Default::default()
    };
    let prog = ProgDefSpec {
        uid: 0,
        gid: 3003,
        ..Default::default()
    };
    let path = write_obj(&dir, "prog1obj.o", &single_prog_single_map(&map, &prog));

    let (critical, result) = load_object(&platform, &env, &path, &LOCATION);
    assert!(!critical);
    result.unwrap();

    // one create, one load, both pinned under the default prefix
    assert_eq!(platform.map_create_count(), 1);
    assert_eq!(platform.prog_load_count(), 1);
    assert!(platform.pin_exists("/sys/fs/bpf/map_prog1obj_m"));
    assert!(platform.pin_exists("/sys/fs/bpf/prog_prog1obj_cgroupskb_prog1"));

    // map shape reached the kernel untouched, with the 4.15+ name
    let creates = platform.map_create_calls();
    assert_eq!(creates[0].map_type, ebpf::BPF_MAP_TYPE_HASH);
    assert_eq!(creates[0].key_size, 4);
    assert_eq!(creates[0].value_size, 4);
    assert_eq!(creates[0].max_entries, 10);
    assert_eq!(creates[0].name.as_deref(), Some("m"));

    // the submitted instruction stream carries the map fd
    let loads = platform.prog_load_calls();
    assert_eq!(loads[0].prog_type, ebpf::BPF_PROG_TYPE_CGROUP_SKB);
    assert_eq!(loads[0].expected_attach_type, ebpf::BPF_ATTACH_TYPE_UNSPEC);
    assert_eq!(loads[0].name.as_deref(), Some("cgroupskb_prog1"));
    assert_eq!(loads[0].license, b"Apache 2.0\0");
    assert_eq!(loads[0].kern_version, kver(5, 10, 0));
    let insns = &loads[0].insns;
    assert_eq!(insns[0], ebpf::BPF_LD_IMM64_OPCODE);
    let imm = LittleEndian::read_i32(&insns[4..8]);
    assert!(imm >= 3, "imm holds the map fd, got {}", imm);
    assert_eq!(insns[1] >> 4, ebpf::BPF_PSEUDO_MAP_FD);
    assert_eq!(insns[1] & 0x0f, 1);

    // modes and owners per descriptor; programs are always 0440
    assert_eq!(platform.pin_mode("/sys/fs/bpf/map_prog1obj_m"), Some(0o660));
    assert_eq!(
        platform.pin_owner("/sys/fs/bpf/map_prog1obj_m"),
        Some((1000, 3003))
    );
    assert_eq!(
        platform.pin_mode("/sys/fs/bpf/prog_prog1obj_cgroupskb_prog1"),
        Some(0o440)
    );
    assert_eq!(
        platform.pin_owner("/sys/fs/bpf/prog_prog1obj_cgroupskb_prog1"),
        Some((0, 3003))
    );

    // every fd was released on the way out; the pins keep the objects alive
    assert_eq!(platform.open_fd_count(), 0);
}

#[test]
fn shared_map_drops_object_name_from_pin() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        shared: true,
        ..Default::default()
    };
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&map, &ProgDefSpec::default()),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert!(platform.pin_exists("/sys/fs/bpf/map__m"));
}

#[test]
fn object_outside_loader_range_is_a_silent_noop() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0)); // loader 42
    let dir = tempfile::tempdir().unwrap();

    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("maps", &encode_map_def(&MapDefSpec::default()))
        .symbol("m", "maps", STT_OBJECT, 0)
        .section("bpfloader_min_ver", &le32(50))
        .section("size_of_bpf_map_def", &le32(128));
    let path = write_obj(&dir, "future.o", &b.build());

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert_eq!(platform.map_create_count(), 0);
    assert_eq!(platform.prog_load_count(), 0);
    assert!(platform.pinned_paths().is_empty());
}

#[test]
fn too_old_loader_fails_the_object() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();

    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("bpfloader_min_required_ver", &le32(50));
    let path = write_obj(&dir, "strict.o", &b.build());

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::LoaderTooOld { min: 50, have: 42 }));
}

#[test]
fn ringbuf_max_entries_rounds_up_to_page_size() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        map_type: ebpf::BPF_MAP_TYPE_RINGBUF,
        key_size: 0,
        value_size: 0,
        max_entries: 1024,
        ..Default::default()
    };

    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("maps", &encode_map_def(&map))
        .symbol("ring", "maps", STT_OBJECT, 0)
        .section("size_of_bpf_map_def", &le32(128));
    let path = write_obj(&dir, "ring.o", &b.build());

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    let creates = platform.map_create_calls();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].max_entries, 4096);
}

#[test]
fn devmap_becomes_array_on_old_kernels() {
    let platform = TestPlatform::new();
    let env = env_on(kver(4, 9, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        map_type: ebpf::BPF_MAP_TYPE_DEVMAP,
        ..Default::default()
    };

    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("maps", &encode_map_def(&map))
        .symbol("dev", "maps", STT_OBJECT, 0)
        .section("size_of_bpf_map_def", &le32(128));
    let path = write_obj(&dir, "dev.o", &b.build());

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    let creates = platform.map_create_calls();
    assert_eq!(creates[0].map_type, ebpf::BPF_MAP_TYPE_ARRAY);
    // 4.9 has no object naming either
    assert_eq!(creates[0].name, None);
}

#[test]
fn optional_program_failure_does_not_stop_the_object() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();

    let optional = ProgDefSpec {
        optional: true,
        ..Default::default()
    };
    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("cgroupskb/p1", &ld_map_fd_prog())
        .symbol("p1", "cgroupskb/p1", STT_FUNC, 0)
        .section("cgroupskb/p2", &ld_map_fd_prog())
        .symbol("p2", "cgroupskb/p2", STT_FUNC, 0)
        .section(
            "progs",
            &[encode_prog_def(&optional), encode_prog_def(&ProgDefSpec::default())].concat(),
        )
        .symbol("p1_def", "progs", STT_OBJECT, 0)
        .symbol("p2_def", "progs", STT_OBJECT, 100)
        .section("size_of_bpf_prog_def", &le32(100));
    let path = write_obj(&dir, "two.o", &b.build());

    platform.fail_next_prog_load(libc::EINVAL, "R1 type mismatch\nprocessed 2 insns");
    load_object(&platform, &env, &path, &LOCATION).1.unwrap();

    // both were submitted, only the survivor got pinned
    assert_eq!(platform.prog_load_count(), 2);
    assert!(!platform.pin_exists("/sys/fs/bpf/prog_two_cgroupskb_p1"));
    assert!(platform.pin_exists("/sys/fs/bpf/prog_two_cgroupskb_p2"));
}

#[test]
fn non_optional_verifier_failure_is_fatal() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let path = write_obj(
        &dir,
        "bad.o",
        &single_prog_single_map(&MapDefSpec::default(), &ProgDefSpec::default()),
    );

    platform.fail_next_prog_load(libc::EACCES, "back-edge from insn 1 to 0");
    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
    assert!(!platform.pin_exists("/sys/fs/bpf/prog_bad_cgroupskb_prog1"));
    // the map was realized before the program failed
    assert!(platform.pin_exists("/sys/fs/bpf/map_bad_m"));
}

#[test]
fn labeled_map_pins_through_rename() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        selinux_context: "fs_bpf_net_shared".to_string(),
        ..Default::default()
    };
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&map, &ProgDefSpec::default()),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();

    assert_eq!(
        platform.renames(),
        vec![(
            "/sys/fs/bpf/net_shared/tmp_map_obj_m".to_string(),
            "/sys/fs/bpf/map_obj_m".to_string()
        )]
    );
    assert!(platform.pin_exists("/sys/fs/bpf/map_obj_m"));
    assert!(!platform
        .pinned_paths()
        .iter()
        .any(|p| p.contains("tmp_")));
}

#[test]
fn unknown_selinux_context_degrades_to_direct_pin() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        selinux_context: "fs_bpf_something_newer".to_string(),
        ..Default::default()
    };
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&map, &ProgDefSpec::default()),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert!(platform.renames().is_empty());
    assert!(platform.pin_exists("/sys/fs/bpf/map_obj_m"));
}

#[test]
fn unknown_pin_subdir_is_fatal_with_enotdir() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        pin_subdir: "vendor/".to_string(),
        ..Default::default()
    };
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&map, &ProgDefSpec::default()),
    );

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::UnrecognizedPinSubdir(_)));
    assert_eq!(err.errno(), libc::ENOTDIR);
    assert_eq!(platform.map_create_count(), 0);
}

#[test]
fn declared_pin_subdir_overrides_the_prefix() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let map = MapDefSpec {
        pin_subdir: "tethering/".to_string(),
        ..Default::default()
    };
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&map, &ProgDefSpec::default()),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert!(platform.pin_exists("/sys/fs/bpf/tethering/map_obj_m"));
}

#[test]
fn nonzero_reserved_field_aborts_before_any_kernel_call() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    // two maps; the *second* is poisoned, yet nothing gets created
    let good = encode_map_def(&MapDefSpec::default());
    let bad = encode_map_def(&MapDefSpec {
        zero: 5,
        ..Default::default()
    });

    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("maps", &[good, bad].concat())
        .symbol("a", "maps", STT_OBJECT, 0)
        .symbol("b", "maps", STT_OBJECT, 128)
        .section("size_of_bpf_map_def", &le32(128));
    let path = write_obj(&dir, "poison.o", &b.build());

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::ReservedFieldNotZero(ref name) if name == "b"));
    assert_eq!(platform.map_create_count(), 0);
    assert!(platform.pinned_paths().is_empty());
}

#[test]
fn gated_out_program_is_never_submitted() {
    let platform = TestPlatform::new();
    let env = env_on(kver(4, 19, 0));
    let dir = tempfile::tempdir().unwrap();
    let prog = ProgDefSpec {
        min_kver: kver(5, 4, 0),
        ..Default::default()
    };
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&MapDefSpec::default(), &prog),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert_eq!(platform.prog_load_count(), 0);
    // the map has no kernel gate of its own and still realizes
    assert_eq!(platform.map_create_count(), 1);
}

#[test]
fn skipped_map_keeps_its_slot_and_relocation_stays_unpatched() {
    let platform = TestPlatform::new();
    let env = env_on(kver(4, 19, 0));
    let dir = tempfile::tempdir().unwrap();
    // map gated out, program optional so its verifier outcome is moot
    let gated = MapDefSpec {
        min_kver: kver(5, 4, 0),
        ..Default::default()
    };
    let prog = ProgDefSpec {
        optional: true,
        ..Default::default()
    };
    let path = write_obj(&dir, "obj.o", &single_prog_single_map(&gated, &prog));

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert_eq!(platform.map_create_count(), 0);
    let loads = platform.prog_load_calls();
    assert_eq!(loads.len(), 1);
    // untouched load-immediate: no fd, no pseudo marker
    assert_eq!(LittleEndian::read_i32(&loads[0].insns[4..8]), 0);
    assert_eq!(loads[0].insns[1] >> 4, 0);
}

#[test]
fn second_run_reuses_everything() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&MapDefSpec::default(), &ProgDefSpec::default()),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    let map_id = platform.pin_id("/sys/fs/bpf/map_obj_m").unwrap();
    let prog_id = platform
        .pin_id("/sys/fs/bpf/prog_obj_cgroupskb_prog1")
        .unwrap();
    let creates = platform.map_create_count();
    let loads = platform.prog_load_count();

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();

    // zero new kernel objects, identical pins
    assert_eq!(platform.map_create_count(), creates);
    assert_eq!(platform.prog_load_count(), loads);
    assert_eq!(platform.pin_id("/sys/fs/bpf/map_obj_m"), Some(map_id));
    assert_eq!(
        platform.pin_id("/sys/fs/bpf/prog_obj_cgroupskb_prog1"),
        Some(prog_id)
    );
}

#[test]
fn stale_pin_with_wrong_shape_is_enotuniq() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&MapDefSpec::default(), &ProgDefSpec::default()),
    );

    platform.plant_pinned_map(
        "/sys/fs/bpf/map_obj_m",
        netbpfload::sys::MapInfo {
            map_type: ebpf::BPF_MAP_TYPE_HASH,
            id: 0,
            key_size: 8, // descriptor says 4
            value_size: 4,
            max_entries: 10,
            map_flags: 0,
        },
    );

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::PinMismatch(_)));
    assert_eq!(err.errno(), libc::ENOTUNIQ);
    assert_eq!(platform.map_create_count(), 0);
}

#[test]
fn missing_license_is_fatal() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let mut b = ObjBuilder::new();
    b.section("maps", &encode_map_def(&MapDefSpec::default()))
        .symbol("m", "maps", STT_OBJECT, 0)
        .section("size_of_bpf_map_def", &le32(128));
    let path = write_obj(&dir, "unlicensed.o", &b.build());

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::MissingLicense));
    assert_eq!(platform.map_create_count(), 0);
}

#[test]
fn code_section_without_prog_def_is_a_bad_object() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("xdp/orphan", &ld_map_fd_prog())
        .symbol("orphan", "xdp/orphan", STT_FUNC, 0);
    let path = write_obj(&dir, "orphan.o", &b.build());

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::MissingProgDef(ref name) if name == "xdp_orphan"));
}

#[test]
fn ragged_maps_section_is_rejected() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let mut rec = encode_map_def(&MapDefSpec::default());
    rec.truncate(100); // not a multiple of the declared 128
    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("maps", &rec)
        .symbol("m", "maps", STT_OBJECT, 0)
        .section("size_of_bpf_map_def", &le32(128));
    let path = write_obj(&dir, "ragged.o", &b.build());

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(err, LoadError::BadRecordSize { section: "maps", .. }));
}

#[test]
fn undersized_record_declaration_is_rejected() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("size_of_bpf_map_def", &le32(16));
    let path = write_obj(&dir, "tiny.o", &b.build());

    let err = load_object(&platform, &env, &path, &LOCATION).1.unwrap_err();
    assert!(matches!(
        err,
        LoadError::RecordSizeTooSmall { section: "maps", size: 16, .. }
    ));
}

#[test]
fn old_format_records_load_with_defaults() {
    // a v0.0 object: 36-byte map records, no version sections at all
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let full = encode_map_def(&MapDefSpec {
        max_entries: 7,
        ..Default::default()
    });
    let mut b = ObjBuilder::new();
    b.section("license", b"GPL\0")
        .section("maps", &full[..36])
        .symbol("legacy", "maps", STT_OBJECT, 0);
    let path = write_obj(&dir, "legacy.o", &b.build());

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    let creates = platform.map_create_calls();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].max_entries, 7);
    assert!(platform.pin_exists("/sys/fs/bpf/map_legacy_legacy"));
}

#[test]
fn dollar_suffix_is_stripped_from_the_pin_name() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let mut b = ObjBuilder::new();
    b.section("license", b"Apache 2.0\0")
        .section("schedcls/shaper$5_4", &ld_map_fd_prog())
        .symbol("shaper$5_4", "schedcls/shaper$5_4", STT_FUNC, 0)
        .section("progs", &encode_prog_def(&ProgDefSpec::default()))
        .symbol("shaper$5_4_def", "progs", STT_OBJECT, 0)
        .section("size_of_bpf_prog_def", &le32(100));
    let path = write_obj(&dir, "alt.o", &b.build());

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert!(platform.pin_exists("/sys/fs/bpf/prog_alt_schedcls_shaper"));
    // the kernel-visible name keeps the suffix
    assert_eq!(
        platform.prog_load_calls()[0].name.as_deref(),
        Some("schedcls_shaper$5_4")
    );
}

#[test]
fn object_variant_suffix_is_stripped_from_pins() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let path = write_obj(
        &dir,
        "offload@2.o",
        &single_prog_single_map(&MapDefSpec::default(), &ProgDefSpec::default()),
    );

    load_object(&platform, &env, &path, &LOCATION).1.unwrap();
    assert!(platform.pin_exists("/sys/fs/bpf/map_offload_m"));
    assert!(platform.pin_exists("/sys/fs/bpf/prog_offload_cgroupskb_prog1"));
}

#[test]
fn directory_driver_tolerates_non_critical_failures() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();

    // an unlicensed (hence failing) non-critical object next to a good one
    let mut bad = ObjBuilder::new();
    bad.section("critical_not", b"\0");
    write_obj(&dir, "bad.o", &bad.build());
    write_obj(
        &dir,
        "good.o",
        &single_prog_single_map(&MapDefSpec::default(), &ProgDefSpec::default()),
    );
    // non-object files are skipped outright
    write_obj(&dir, "README.txt", b"not an object");

    let location = Location {
        dir: Box::leak(dir.path().to_string_lossy().into_owned().into_boxed_str()),
        prefix: "",
    };
    load_dir(&platform, &env, &location).unwrap();
    assert!(platform.pin_exists("/sys/fs/bpf/map_good_m"));
}

#[test]
fn directory_driver_propagates_critical_failures() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();

    // critical but unlicensed: the directory status must go bad
    let mut bad = ObjBuilder::new();
    bad.section("critical", b"netd\0");
    write_obj(&dir, "bad.o", &bad.build());

    let location = Location {
        dir: Box::leak(dir.path().to_string_lossy().into_owned().into_boxed_str()),
        prefix: "",
    };
    let err = load_dir(&platform, &env, &location).unwrap_err();
    assert!(matches!(err, LoadError::MissingLicense));
}

#[test]
fn prefix_prefixes_unlabeled_pins() {
    let platform = TestPlatform::new();
    let env = env_on(kver(5, 10, 0));
    let dir = tempfile::tempdir().unwrap();
    let path = write_obj(
        &dir,
        "obj.o",
        &single_prog_single_map(&MapDefSpec::default(), &ProgDefSpec::default()),
    );
    let location = Location {
        dir: "/nonexistent",
        prefix: "tethering/",
    };

    load_object(&platform, &env, &path, &location).1.unwrap();
    assert!(platform.pin_exists("/sys/fs/bpf/tethering/map_obj_m"));
    assert!(platform.pin_exists("/sys/fs/bpf/tethering/prog_obj_cgroupskb_prog1"));
}
