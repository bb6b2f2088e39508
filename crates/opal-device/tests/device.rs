//! Device-level integration tests: registry behavior, page-flip deferral,
//! capability enforcement, shutdown, and cross-connection concurrency.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use opal_abi::{
    Capabilities, CommandBufferHeader, CommandBufferLayout, ExecResource, ImageDescriptor, Status,
};
use opal_device::{DeviceError, SystemBuffer, SystemDevice, SystemSemaphore, TestBackend};
use opal_platform::{MemoryObject, PlatformBuffer, Semaphore, PAGE_SIZE};
use pretty_assertions::assert_eq;

fn test_device() -> (Arc<TestBackend>, Arc<SystemDevice>) {
    let backend = Arc::new(TestBackend::new());
    let device = SystemDevice::new(backend.clone());
    (backend, device)
}

#[test]
fn open_rejects_invalid_capability_masks() {
    let (_backend, device) = test_device();

    for raw in [0u32, 0b100, 0b111, u32::MAX] {
        assert_eq!(
            device.connect(1, raw).err(),
            Some(DeviceError::InvalidCapabilities { raw })
        );
    }
}

#[test]
fn buffer_registry_dedupes_imports_of_one_object() {
    let (_backend, device) = test_device();
    let object = MemoryObject::create(2 * PAGE_SIZE).unwrap();

    let first = device.get_buffer_for_handle(object.duplicate()).unwrap();
    let second = device.get_buffer_for_handle(object.duplicate()).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.id(), object.id());
    assert_eq!(first.size(), 2 * PAGE_SIZE);
    assert_eq!(device.sweep_buffer_registry(), 1);

    drop(first);
    drop(second);
    assert_eq!(device.sweep_buffer_registry(), 0);
}

#[test]
fn release_buffer_is_lazy_eviction_only() {
    let (_backend, device) = test_device();
    let object = MemoryObject::create(PAGE_SIZE).unwrap();

    let buffer = device.get_buffer_for_handle(object.duplicate()).unwrap();
    let id = buffer.id();

    // Entry has a live owner: release must not evict it.
    device.release_buffer(id);
    let again = device.get_buffer_for_handle(object.duplicate()).unwrap();
    assert!(Arc::ptr_eq(&buffer, &again));

    drop(buffer);
    drop(again);
    device.release_buffer(id);
    assert_eq!(device.sweep_buffer_registry(), 0);
}

#[test]
fn page_flip_while_disabled_defers_semaphores() {
    let (backend, device) = test_device();
    let object = MemoryObject::create(PAGE_SIZE).unwrap();
    let buffer = device.get_buffer_for_handle(object).unwrap();

    let wait = Semaphore::new();
    wait.signal(); // observable reset later
    let signal = Semaphore::new();
    let sys_wait = SystemSemaphore::create(device.backend(), wait.duplicate()).unwrap();
    let sys_signal = SystemSemaphore::create(device.backend(), signal.duplicate()).unwrap();

    let status = device.page_flip(
        Arc::clone(&buffer),
        &ImageDescriptor::default(),
        1,
        1,
        vec![sys_wait, sys_signal],
    );
    assert_eq!(status, Status::Ok);
    // The backend flip path must not run while display output is disabled.
    assert_eq!(backend.stats().flips, 0);
    assert!(wait.is_signaled());
    assert!(!signal.is_signaled());

    let last = device.page_flip_and_enable(&buffer, &ImageDescriptor::default(), true);
    assert_eq!(backend.stats().flips, 1);
    // Deferred wait reset, deferred signal signaled.
    assert!(!wait.is_signaled());
    assert!(signal.is_signaled());
    // Nothing had gone through the normal flip path yet.
    assert!(last.is_none());

    // Deferred maps were cleared: a second enable resolves nothing twice.
    signal.reset();
    device.page_flip_and_enable(&buffer, &ImageDescriptor::default(), true);
    assert!(!signal.is_signaled());
}

#[test]
fn enabled_page_flip_reaches_backend_and_retains_buffer() {
    let (backend, device) = test_device();
    let object = MemoryObject::create(PAGE_SIZE).unwrap();
    let buffer = device.get_buffer_for_handle(object).unwrap();

    device.page_flip_and_enable(&buffer, &ImageDescriptor::default(), true);
    assert_eq!(backend.stats().flips, 1);

    let presented = Semaphore::new();
    let sys_presented = SystemSemaphore::create(device.backend(), presented.duplicate()).unwrap();
    let status = device.page_flip(
        Arc::clone(&buffer),
        &ImageDescriptor::default(),
        0,
        1,
        vec![sys_presented],
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(backend.stats().flips, 2);
    assert!(presented.is_signaled());

    // The flipped buffer is retained as the scanout source even after the
    // caller drops its reference.
    let id = buffer.id();
    drop(buffer);
    assert_eq!(device.sweep_buffer_registry(), 1);
    let last = device.page_flip_and_enable(
        &device
            .get_buffer_for_handle(MemoryObject::create(PAGE_SIZE).unwrap())
            .unwrap(),
        &ImageDescriptor::default(),
        true,
    );
    assert_eq!(last.unwrap().id(), id);
}

#[test]
fn rendering_only_connection_cannot_flip_but_keeps_rendering() {
    let (backend, device) = test_device();
    let ipc = device
        .connect(7, Capabilities::RENDERING.bits())
        .unwrap();

    let buffer = PlatformBuffer::create(PAGE_SIZE).unwrap();
    ipc.import_buffer(&buffer).unwrap();
    assert_eq!(ipc.get_error(), Status::Ok);

    // Display-only operation: rejected distinctly, not a generic failure.
    let presented = Semaphore::new();
    ipc.page_flip(buffer.id(), ImageDescriptor::default(), &[], &[], &presented)
        .unwrap();
    assert_eq!(ipc.get_error(), Status::AccessDenied);
    assert_eq!(backend.stats().flips, 0);

    // Subsequent rendering operations on the same connection are unaffected.
    let context_id = ipc.create_context().unwrap();
    assert_eq!(ipc.wait_rendering(buffer.id()), Status::Ok);
    ipc.destroy_context(context_id).unwrap();
    assert_eq!(ipc.get_error(), Status::Ok);

    drop(ipc);
    device.shutdown();
}

#[test]
fn execute_command_buffer_end_to_end() {
    let (backend, device) = test_device();
    let ipc = device
        .connect(3, Capabilities::RENDERING.bits())
        .unwrap();

    // Batch buffer plus a command buffer describing it.
    let batch = PlatformBuffer::create(PAGE_SIZE).unwrap();
    let command = PlatformBuffer::create(PAGE_SIZE).unwrap();

    let layout = CommandBufferLayout {
        header: CommandBufferHeader {
            batch_buffer_resource_index: 0,
            batch_start_offset: 0,
            num_resources: 1,
        },
        resources: vec![ExecResource {
            buffer_id: batch.id(),
            num_relocations: 0,
            offset: 0,
            length: batch.size(),
        }],
        relocations: vec![vec![]],
    };
    command.map_cpu();
    command.write_at(0, &layout.encode()).unwrap();
    command.unmap_cpu().unwrap();

    ipc.import_buffer(&batch).unwrap();
    ipc.import_buffer(&command).unwrap();
    let context_id = ipc.create_context().unwrap();
    ipc.execute_command_buffer(command.id(), context_id).unwrap();
    assert_eq!(ipc.wait_rendering(batch.id()), Status::Ok);
    assert_eq!(ipc.get_error(), Status::Ok);

    assert_eq!(backend.stats().executes, 1);
    assert_eq!(backend.stats().waits, 1);

    // Executing a command buffer that references an unimported resource
    // latches an error without killing the connection.
    ipc.release_buffer(batch.id()).unwrap();
    ipc.execute_command_buffer(command.id(), context_id).unwrap();
    assert_eq!(ipc.get_error(), Status::InvalidArgs);
    assert_eq!(backend.stats().executes, 1);

    drop(ipc);
    device.shutdown();
}

#[test]
fn display_flip_via_connection_defers_until_enabled() {
    let (backend, device) = test_device();
    let ipc = device
        .connect(9, (Capabilities::RENDERING | Capabilities::DISPLAY).bits())
        .unwrap();

    let buffer = PlatformBuffer::create(PAGE_SIZE).unwrap();
    ipc.import_buffer(&buffer).unwrap();

    let presented = Semaphore::new();
    ipc.page_flip(buffer.id(), ImageDescriptor::default(), &[], &[], &presented)
        .unwrap();
    assert_eq!(ipc.get_error(), Status::Ok);
    assert_eq!(backend.stats().flips, 0);
    assert!(!presented.is_signaled());

    // Driver thread enables display output; the deferred presented
    // semaphore resolves.
    let scanout = device
        .get_buffer_for_handle(buffer.duplicate_handle())
        .unwrap();
    device.page_flip_and_enable(&scanout, &ImageDescriptor::default(), true);
    presented.wait(Some(Duration::from_secs(5))).unwrap();

    // Flips now reach the backend directly.
    let presented_again = Semaphore::new();
    ipc.page_flip(
        buffer.id(),
        ImageDescriptor::default(),
        &[],
        &[],
        &presented_again,
    )
    .unwrap();
    assert_eq!(ipc.get_error(), Status::Ok);
    presented_again.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(backend.stats().flips, 2);

    drop(ipc);
    device.shutdown();
}

#[test]
fn shutdown_joins_idle_connections_and_blocks_new_opens() {
    let (_backend, device) = test_device();

    let connections: Vec<_> = (0..3)
        .map(|client| device.connect(client, Capabilities::RENDERING.bits()).unwrap())
        .collect();

    // All three dispatch loops are blocked waiting for requests; shutdown
    // must wake and join them.
    device.shutdown();

    for ipc in &connections {
        assert_eq!(ipc.get_error(), Status::ConnectionLost);
    }
    assert!(matches!(
        device.connect(99, Capabilities::RENDERING.bits()),
        Err(DeviceError::ShuttingDown)
    ));
}

#[test]
fn concurrent_import_release_cycles_leave_no_registry_entries() {
    const THREADS: u64 = 4;
    const CYCLES: usize = 16;

    let (_backend, device) = test_device();

    let mut workers = Vec::new();
    for client in 0..THREADS {
        let device = Arc::clone(&device);
        workers.push(thread::spawn(move || {
            let ipc = device
                .connect(client, Capabilities::RENDERING.bits())
                .unwrap();
            for _ in 0..CYCLES {
                let buffer = PlatformBuffer::create(PAGE_SIZE).unwrap();
                ipc.import_buffer(&buffer).unwrap();
                assert_eq!(ipc.get_error(), Status::Ok);
                ipc.release_buffer(buffer.id()).unwrap();
                assert_eq!(ipc.get_error(), Status::Ok);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    device.shutdown();
    // Every buffer lost its last owner; a final sweep leaves nothing live.
    assert_eq!(device.sweep_buffer_registry(), 0);
}

#[test]
fn concurrent_imports_of_one_object_share_a_buffer() {
    const THREADS: usize = 8;

    let (backend, device) = test_device();
    let object = MemoryObject::create(PAGE_SIZE).unwrap();

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let device = Arc::clone(&device);
        let handle = object.duplicate();
        workers.push(thread::spawn(move || {
            device.get_buffer_for_handle(handle).unwrap()
        }));
    }
    let buffers: Vec<Arc<SystemBuffer>> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();

    for buffer in &buffers[1..] {
        assert!(Arc::ptr_eq(&buffers[0], buffer));
    }
    // One backend import despite eight racing lookups.
    assert_eq!(backend.stats().buffers_imported, 1);
    assert_eq!(device.sweep_buffer_registry(), 1);
}
