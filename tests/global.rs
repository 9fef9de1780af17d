use vmsim::{global, VirtAddr, VmError};

#[test]
fn process_wide_instance() {
    let mut buf = [0u8; 4];
    assert_eq!(
        global::read(VirtAddr::new(0x1000), &mut buf),
        Err(VmError::NotInitialized)
    );

    let first = global::alloc(1).expect("alloc");
    assert_eq!(first.as_u64(), 0x1000);
    let second = global::alloc(1).expect("alloc");
    assert_ne!(first, second);

    global::write(first, b"vmem").expect("write");
    global::read(first, &mut buf).expect("read");
    assert_eq!(&buf, b"vmem");

    global::free(first, 1).expect("free");
    global::free(second, 1).expect("free");
    assert!(global::tlb_stats().lookups() > 0);
}
