//! End-to-end flows through the public engine API: VM creation, guest
//! memory plumbing, the hypercall surface and the secure-world lifecycle.

use partivisor_core::ept::{EPT_RWX, EPT_WB};
use partivisor_core::guest_memory::{copy_from_gpa, copy_to_gpa};
use partivisor_core::hypercall::{self, HC_GET_API_VERSION, HC_WORLD_SWITCH};
use partivisor_core::vcpu::CpuReg;
use partivisor_core::{create_vm, VmConfig, VmType};

/// Back `[gpa, +pages*4K)` with leaked, page-aligned host memory.
fn back(vm: &partivisor_core::Vm, gpa: u64, pages: usize) -> u64 {
    let buf: Box<[u8]> = vec![0u8; (pages + 1) * 4096].into_boxed_slice();
    let addr = Box::leak(buf).as_ptr() as u64;
    let aligned = (addr + 0xFFF) & !0xFFF;
    vm.ept_add_mr(aligned, gpa, pages as u64 * 4096, EPT_RWX | EPT_WB)
        .unwrap();
    aligned
}

#[test]
fn guest_memory_round_trip_through_created_vm() {
    let vm = create_vm(VmConfig::new(VmType::User, 1).named("memvm")).unwrap();
    back(&vm, 0x10_0000, 4);

    let message = b"partitioning hypervisors move bytes";
    copy_to_gpa(&vm, message, 0x10_0400).unwrap();
    let mut readback = [0u8; 35];
    copy_from_gpa(&vm, &mut readback, 0x10_0400).unwrap();
    assert_eq!(&readback, message);
}

#[test]
fn api_version_hypercall_from_service_vm() {
    let svm = create_vm(VmConfig::new(VmType::Service, 1).named("service")).unwrap();
    let hpa = back(&svm, 0x5000, 1);

    let cell = svm.vcpu(0).unwrap();
    // SAFETY: the vCPU never runs in this test.
    let vcpu = unsafe { cell.body_mut() };
    vcpu.set_gpreg(CpuReg::Rax, HC_GET_API_VERSION);
    vcpu.set_gpreg(CpuReg::Rdi, 0x5000);

    hypercall::vmcall_vmexit_handler(cell, vcpu, &svm).unwrap();
    assert_eq!(vcpu.get_gpreg(CpuReg::Rax), 0, "hypercall returns success");

    let bytes = unsafe { std::slice::from_raw_parts(hpa as *const u8, 8) };
    assert_eq!(
        &bytes[0..4],
        &hypercall::API_VERSION_MAJOR.to_le_bytes(),
        "major version written back to the parameter page"
    );
}

#[test]
fn world_switch_hypercall_requires_a_secure_world() {
    let uvm = create_vm(VmConfig::new(VmType::User, 1).named("teevm")).unwrap();
    let cell = uvm.vcpu(0).unwrap();
    // SAFETY: the vCPU never runs in this test.
    let vcpu = unsafe { cell.body_mut() };
    vcpu.set_gpreg(CpuReg::Rax, HC_WORLD_SWITCH);

    hypercall::vmcall_vmexit_handler(cell, vcpu, &uvm).unwrap();
    let rax = vcpu.get_gpreg(CpuReg::Rax) as i64;
    assert!(rax < 0, "world switch without a secure world must fail");
}

#[test]
fn vm_lifecycle_is_enforced() {
    let vm = create_vm(VmConfig::new(VmType::User, 2).named("lifecycle")).unwrap();
    assert!(vm.pause().is_err(), "cannot pause before start");
    vm.start(0x100_0000).unwrap();
    assert!(vm.start(0x100_0000).is_err(), "double start refused");
    vm.pause().unwrap();
    vm.reset().unwrap();
    vm.start(0x100_0000).unwrap();
    vm.shutdown();
    assert_eq!(vm.state(), partivisor_core::VmState::PoweredOff);
}
