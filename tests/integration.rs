#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use gpucs::cs::packet::{decode_stream, opcode, pkt7_header, PacketHeader};
    use gpucs::kgd::NullKgd;
    use gpucs::prelude::*;
    use gpucs::{reset_fences, CachePolicy, CommandBufferHandle, CommandStream, PoolResetFlags, Requirements};
    use pretty_assertions::assert_eq;

    fn open(config: DeviceConfig) -> (Arc<NullKgd>, Device) {
        let kgd = Arc::new(NullKgd::new());
        let device = Device::new(kgd.clone(), config).expect("null device");
        (kgd, device)
    }

    fn record(pool: &mut CommandPool, usage: UsageFlags, body: impl FnOnce(&mut CommandBuffer)) -> CommandBufferHandle {
        let handle = pool.allocate(Level::Primary, 1).unwrap()[0];
        let cb = pool.get_mut(handle).unwrap();
        cb.begin(usage).unwrap();
        body(cb);
        cb.end().unwrap();
        handle
    }

    #[test]
    fn test_empty_submit() {
        let (kgd, device) = open(DeviceConfig::default());
        let mut pool = device.create_command_pool().unwrap();
        let handle = record(&mut pool, UsageFlags::empty(), |_| {});

        let mut queue = device.create_queue().unwrap();
        let out = device.create_sync(false).unwrap();
        queue
            .submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], Some(&out))
            .unwrap();

        let submission = kgd.last_submission().unwrap();
        assert_eq!(submission.commands.len(), 1);
        assert_eq!(submission.out_sync, out.id());
        assert_eq!(submission.words(), vec![pkt7_header(opcode::CP_NOP, 3), 0, 0, 0]);
        assert!(wait_fences(&device, &[&out], true, u64::MAX).is_ok());
    }

    #[test]
    fn test_two_buffer_ordering() {
        let (kgd, device) = open(DeviceConfig::default());
        let mut pool = device.create_command_pool().unwrap();
        let a = record(&mut pool, UsageFlags::empty(), |cb| cb.cmd_pkt7(0x55, &[0xDEAD]));
        let b = record(&mut pool, UsageFlags::empty(), |cb| cb.cmd_pkt7(0x55, &[0xBEEF]));

        let mut queue = device.create_queue().unwrap();
        queue.submit(&mut pool.get_many_mut(&[a, b]).unwrap(), &[], None).unwrap();

        let submission = kgd.last_submission().unwrap();
        assert_eq!(submission.commands.len(), 2);
        assert_ne!(
            (submission.commands[0].gpu_addr, submission.commands[0].size),
            (submission.commands[1].gpu_addr, submission.commands[1].size)
        );
        let header = pkt7_header(0x55, 1);
        assert_eq!(submission.ib_words[0][4..], [header, 0xDEAD]);
        assert_eq!(submission.ib_words[1][4..], [header, 0xBEEF]);

        let words = submission.words();
        let a_pos = words.iter().position(|&w| w == 0xDEAD).unwrap();
        let b_pos = words.iter().position(|&w| w == 0xBEEF).unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn test_stream_chunking() {
        let (_, device) = open(DeviceConfig::default());
        let mut cs = CommandStream::with_chunk_size(Arc::clone(device.bo_allocator()), 16 * 1024, true);
        for i in 0..5000u32 {
            cs.reserve_space(1).unwrap();
            cs.emit(i);
        }
        cs.end().unwrap();

        assert!(cs.bo_count() >= 2);
        assert_eq!(cs.recorded_bytes(), 5000 * 4);
        let last = cs.entries().last().unwrap();
        assert_eq!(last.offset as u64 + last.size as u64, cs.cur_offset());
        assert!(Arc::ptr_eq(&last.bo, cs.current_bo().unwrap()));

        // Ranges of distinct entries never overlap
        let entries = cs.entries();
        for (i, x) in entries.iter().enumerate() {
            for y in &entries[i + 1..] {
                let disjoint = x.gpu_addr() + x.size as u64 <= y.gpu_addr() || y.gpu_addr() + y.size as u64 <= x.gpu_addr();
                assert!(disjoint);
            }
        }
    }

    #[test]
    fn test_cache_reuse() {
        let (_, device) = open(DeviceConfig::default());
        let first = device.create_bo(8192, BoFlags::empty()).unwrap();
        let (handle, addr) = (first.handle(), first.gpu_addr());
        drop(first);

        let second = device.create_bo(8192, BoFlags::empty()).unwrap();
        assert_eq!((second.handle(), second.gpu_addr()), (handle, addr));
    }

    #[test]
    fn test_purged_cache_entry_is_not_reused() {
        let (kgd, device) = open(DeviceConfig::default());
        kgd.set_discard_on_willneed(true);
        let first = device.create_bo(8192, BoFlags::empty()).unwrap();
        let handle = first.handle();
        drop(first);

        let second = device.create_bo(8192, BoFlags::empty()).unwrap();
        assert_ne!(second.handle(), handle);
        assert!(!kgd.is_bo_open(handle));
    }

    #[test]
    fn test_wait_timeout() {
        let (_, device) = open(DeviceConfig::default());
        let sync = device.create_sync(false).unwrap();
        let start = Instant::now();
        assert_eq!(wait_fences(&device, &[&sync], true, 1_000_000), Err(Error::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1));
        assert!(elapsed < Duration::from_millis(100));
    }

    #[test]
    fn test_device_lost_after_failed_submit() {
        let (kgd, device) = open(DeviceConfig::default());
        let mut pool = device.create_command_pool().unwrap();
        let handle = record(&mut pool, UsageFlags::empty(), |_| {});
        let mut queue = device.create_queue().unwrap();
        let out = device.create_sync(false).unwrap();

        kgd.fail_next_submit(libc::EIO);
        let mut cbs = pool.get_many_mut(&[handle]).unwrap();
        assert!(matches!(queue.submit(&mut cbs, &[], Some(&out)), Err(Error::DeviceLost(_))));

        let calls = kgd.total_calls();
        for _ in 0..3 {
            assert!(matches!(queue.submit(&mut cbs, &[], Some(&out)), Err(Error::DeviceLost(_))));
            assert!(matches!(wait_fences(&device, &[&out], true, 0), Err(Error::DeviceLost(_))));
        }
        assert_eq!(kgd.total_calls(), calls);
        assert!(device.lost_reason().unwrap().contains("submit"));
    }

    #[test]
    fn test_pending_until_complete() {
        let (kgd, device) = open(DeviceConfig::default());
        kgd.set_auto_complete(false);
        let mut pool = device.create_command_pool().unwrap();
        let reusable = record(&mut pool, UsageFlags::empty(), |cb| cb.draw(3, 1, 0, 0));
        let once = record(&mut pool, UsageFlags::ONE_TIME_SUBMIT, |_| {});

        let mut queue = device.create_queue().unwrap();
        queue
            .submit(&mut pool.get_many_mut(&[reusable, once]).unwrap(), &[], None)
            .unwrap();
        assert!(kgd.last_submission().unwrap().requirements.contains(Requirements::FRAGMENT));

        let cb = pool.get_mut(reusable).unwrap();
        assert_eq!(cb.refresh_status().unwrap(), Status::Pending);
        assert!(matches!(cb.reset(), Err(Error::InvalidUsage(_))));
        assert!(matches!(
            queue.submit(&mut pool.get_many_mut(&[reusable]).unwrap(), &[], None),
            Err(Error::InvalidUsage(_))
        ));

        kgd.complete_all();
        assert_eq!(pool.get_mut(reusable).unwrap().refresh_status().unwrap(), Status::Executable);
        assert_eq!(pool.get_mut(once).unwrap().refresh_status().unwrap(), Status::Invalid);
        queue.wait_idle().unwrap();
    }

    #[test]
    fn test_simultaneous_use_resubmit() {
        let (kgd, device) = open(DeviceConfig::default());
        kgd.set_auto_complete(false);
        let mut pool = device.create_command_pool().unwrap();
        let handle = record(&mut pool, UsageFlags::SIMULTANEOUS_USE, |_| {});
        let mut queue = device.create_queue().unwrap();

        for _ in 0..2 {
            queue.submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], None).unwrap();
        }
        assert_eq!(kgd.submissions().len(), 2);
        kgd.complete_all();
        assert_eq!(pool.get_mut(handle).unwrap().refresh_status().unwrap(), Status::Executable);
    }

    #[test]
    fn test_queue_fence_orders_second_queue() {
        let (kgd, device) = open(DeviceConfig::default());
        kgd.set_auto_complete(false);
        let mut pool = device.create_command_pool().unwrap();
        let first = record(&mut pool, UsageFlags::empty(), |_| {});
        let second = record(&mut pool, UsageFlags::empty(), |_| {});

        let mut graphics = device.create_queue().unwrap();
        let mut compute = device.create_queue_with(0, Requirements::COMPUTE).unwrap();
        graphics.submit(&mut pool.get_many_mut(&[first]).unwrap(), &[], None).unwrap();

        let fence = graphics.create_fence().unwrap();
        assert!(!fence.is_signaled().unwrap());
        compute
            .submit(&mut pool.get_many_mut(&[second]).unwrap(), &[&fence], None)
            .unwrap();
        let submission = kgd.last_submission().unwrap();
        assert_eq!(submission.in_syncs, vec![fence.id()]);
        assert_eq!(submission.requirements, Requirements::COMPUTE);

        kgd.complete_all();
        assert!(fence.is_signaled().unwrap());
    }

    #[test]
    fn test_fence_export_import_preserves_wait() {
        let (kgd, device) = open(DeviceConfig::default());
        kgd.set_auto_complete(false);
        let mut pool = device.create_command_pool().unwrap();
        let handle = record(&mut pool, UsageFlags::empty(), |_| {});
        let mut queue = device.create_queue().unwrap();
        let out = device.create_sync(false).unwrap();
        queue.submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], Some(&out)).unwrap();

        let fd = out.export_sync_file().unwrap();
        let imported = device.create_sync(false).unwrap();
        imported.import_sync_file(std::os::fd::AsRawFd::as_raw_fd(&fd)).unwrap();
        assert_eq!(wait_fences(&device, &[&imported], true, 0), Err(Error::Timeout));

        kgd.complete_all();
        assert!(wait_fences(&device, &[&imported], true, 0).is_ok());
    }

    #[test]
    fn test_secondary_execution() {
        let (kgd, device) = open(DeviceConfig::default());
        let mut pool = device.create_command_pool().unwrap();
        let secondary = pool.allocate(Level::Secondary, 1).unwrap()[0];
        {
            let cb = pool.get_mut(secondary).unwrap();
            cb.begin(UsageFlags::RENDER_PASS_CONTINUE).unwrap();
            cb.draw(6, 2, 0, 0);
            cb.end().unwrap();
        }
        let primary = pool.allocate(Level::Primary, 1).unwrap()[0];
        {
            let mut cbs = pool.get_many_mut(&[primary, secondary]).unwrap();
            let (head, tail) = cbs.split_at_mut(1);
            head[0].begin(UsageFlags::empty()).unwrap();
            head[0].execute_commands(&[&*tail[0]]);
            head[0].end().unwrap();
        }

        let mut queue = device.create_queue().unwrap();
        queue.submit(&mut pool.get_many_mut(&[primary]).unwrap(), &[], None).unwrap();

        let submission = kgd.last_submission().unwrap();
        assert!(submission.requirements.contains(Requirements::FRAGMENT));
        let words = submission.words();
        let packets = decode_stream(&words).unwrap();
        assert!(packets
            .iter()
            .any(|(h, _)| *h == PacketHeader::Type7 { opcode: opcode::CP_INDIRECT_BUFFER, count: 3 }));

        let secondary_bo = pool.get(secondary).unwrap().cs().entries()[0].bo.handle();
        assert!(submission.residency.iter().any(|e| e.handle == secondary_bo));
    }

    #[test]
    fn test_pool_reset_returns_buffers_to_initial() {
        let (_, device) = open(DeviceConfig::default());
        let mut pool = device.create_command_pool().unwrap();
        let scratch = device.create_bo(4096, BoFlags::empty()).unwrap();
        for _ in 0..4 {
            record(&mut pool, UsageFlags::empty(), |cb| {
                cb.use_bo(&scratch, AccessFlags::READ);
                cb.dispatch(1, 1, 1);
            });
        }

        pool.reset(PoolResetFlags::empty()).unwrap();
        for handle in pool.handles() {
            let cb = pool.get(handle).unwrap();
            assert_eq!(cb.status(), Status::Initial);
            assert!(cb.cs().is_empty());
            assert!(cb.residency().is_empty());
        }
        assert!(pool.all_in(Status::Initial));
    }

    #[test]
    fn test_residency_has_no_duplicates() {
        let (kgd, device) = open(DeviceConfig::default());
        let bo = device.create_bo(4096, BoFlags::empty()).unwrap();
        let mut pool = device.create_command_pool().unwrap();
        let a = record(&mut pool, UsageFlags::empty(), |cb| {
            cb.use_bo(&bo, AccessFlags::READ);
            cb.use_bo(&bo, AccessFlags::WRITE);
        });
        let b = record(&mut pool, UsageFlags::empty(), |cb| cb.use_bo(&bo, AccessFlags::READ));
        assert_eq!(pool.get(a).unwrap().residency().len(), 1);

        let mut queue = device.create_queue().unwrap();
        queue.submit(&mut pool.get_many_mut(&[a, b]).unwrap(), &[], None).unwrap();

        let residency = kgd.last_submission().unwrap().residency;
        let mut handles: Vec<u32> = residency.iter().map(|e| e.handle).collect();
        let total = handles.len();
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), total);
        let entry = residency.iter().find(|e| e.handle == bo.handle()).unwrap();
        assert_eq!(entry.flags, AccessFlags::READ | AccessFlags::WRITE);
    }

    #[test]
    fn test_teardown_releases_kernel_objects() {
        let (kgd, device) = open(DeviceConfig::default());
        {
            let mut pool = device.create_command_pool().unwrap();
            let handle = record(&mut pool, UsageFlags::empty(), |cb| cb.dispatch(4, 4, 1));
            let mut queue = device.create_queue().unwrap();
            queue.submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], None).unwrap();
            queue.wait_idle().unwrap();
            let fence = queue.create_fence().unwrap();
            fence.wait(u64::MAX).unwrap();
        }
        drop(device);

        assert_eq!(kgd.live_bos(), Vec::<u32>::new());
        assert_eq!(kgd.live_syncs(), 0);
        assert_eq!(kgd.live_queues(), 0);
    }

    #[test]
    fn test_disabled_cache_closes_on_drop() {
        let config = DeviceConfig {
            bo_cache: CachePolicy::Disabled,
            ..DeviceConfig::default()
        };
        let (kgd, device) = open(config);
        let bo = device.create_bo(8192, BoFlags::empty()).unwrap();
        let handle = bo.handle();
        drop(bo);
        assert!(!kgd.is_bo_open(handle));
        assert_eq!(device.bo_allocator().cached_count(), 0);
    }

    #[test]
    fn test_empty_recording_without_begin_nop() {
        let config = DeviceConfig {
            emit_begin_nop: false,
            ..DeviceConfig::default()
        };
        let (kgd, device) = open(config);
        let mut pool = device.create_command_pool().unwrap();
        let handle = record(&mut pool, UsageFlags::empty(), |_| {});
        assert_eq!(pool.get(handle).unwrap().status(), Status::Executable);
        assert_eq!(pool.get(handle).unwrap().cs().entry_count(), 0);

        let mut queue = device.create_queue().unwrap();
        let out = device.create_sync(false).unwrap();
        queue
            .submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], Some(&out))
            .unwrap();
        assert!(kgd.last_submission().unwrap().commands.is_empty());
        assert!(out.wait(u64::MAX).is_ok());
    }

    #[test]
    fn test_update_buffer_lands_in_stream() {
        let (kgd, device) = open(DeviceConfig::default());
        let dst = device.create_bo(4096, BoFlags::empty()).unwrap();
        let mut pool = device.create_command_pool().unwrap();
        let handle = record(&mut pool, UsageFlags::empty(), |cb| {
            cb.update_buffer(&dst, 64, &[1, 2, 3]);
            cb.pipeline_barrier(BarrierFlags::WAIT_FOR_IDLE);
        });

        let mut queue = device.create_queue().unwrap();
        queue.submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], None).unwrap();

        let submission = kgd.last_submission().unwrap();
        let words = submission.words();
        let packets = decode_stream(&words).unwrap();
        let (_, payload) = packets
            .iter()
            .find(|(h, _)| matches!(h, PacketHeader::Type7 { opcode: opcode::CP_MEM_WRITE, .. }))
            .unwrap();
        let addr = dst.gpu_addr() + 64;
        assert_eq!(payload.to_vec(), vec![addr as u32, (addr >> 32) as u32, 1, 2, 3]);
        let entry = submission.residency.iter().find(|e| e.handle == dst.handle()).unwrap();
        assert!(entry.flags.contains(AccessFlags::WRITE));
    }

    #[test]
    fn test_record_submit_wait_reset_loop() {
        let (kgd, device) = open(DeviceConfig::default());
        kgd.set_auto_complete(false);
        let mut pool = device.create_command_pool().unwrap();
        let handle = pool.allocate(Level::Primary, 1).unwrap()[0];
        let mut queue = device.create_queue().unwrap();
        let fence = device.create_sync(false).unwrap();

        for frame in 0..4u32 {
            let cb = pool.get_mut(handle).unwrap();
            cb.begin(UsageFlags::ONE_TIME_SUBMIT).unwrap();
            cb.cmd_pkt7(0x55, &[frame]);
            cb.end().unwrap();

            queue
                .submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], Some(&fence))
                .unwrap();
            assert_eq!(kgd.last_submission().unwrap().out_sync, fence.id());
            assert!(matches!(fence.wait(0), Err(Error::Timeout)));
            assert!(matches!(
                pool.get_mut(handle).unwrap().begin(UsageFlags::empty()),
                Err(Error::InvalidUsage(_))
            ));

            kgd.complete_all();
            fence.wait(u64::MAX).unwrap();
            reset_fences(&device, &[&fence]).unwrap();
            assert!(!fence.is_signaled().unwrap());
        }

        assert_eq!(kgd.submissions().len(), 4);
        let words = kgd.last_submission().unwrap().words();
        assert_eq!(words[words.len() - 2..], [pkt7_header(0x55, 1), 3]);
        assert_eq!(pool.get_mut(handle).unwrap().refresh_status().unwrap(), Status::Invalid);
    }

    mod scripted {
        use std::collections::HashSet;
        use std::io;
        use std::os::fd::{FromRawFd, OwnedFd, RawFd};
        use std::ptr::NonNull;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::{Arc, Mutex};

        use gpucs::kgd::{CommandTuple, Kgd, Madvise, NewBo, Param, ResidencyEntry, WaitStatus};
        use gpucs::prelude::*;
        use gpucs::{reset_fences, Requirements};
        use mockall::mock;

        mock! {
            pub Driver {}
            impl Kgd for Driver {
                fn name(&self) -> &'static str;
                fn bo_new(&self, size: u64, flags: BoFlags) -> io::Result<NewBo>;
                fn bo_close(&self, handle: u32);
                fn bo_map(&self, handle: u32, size: u64) -> io::Result<NonNull<u8>>;
                fn bo_munmap(&self, ptr: NonNull<u8>, size: u64);
                fn bo_export(&self, handle: u32) -> io::Result<OwnedFd>;
                fn bo_import(&self, fd: RawFd) -> io::Result<NewBo>;
                fn bo_madvise(&self, handle: u32, advice: Madvise) -> io::Result<bool>;
                fn queue_new(&self, priority: u32, flags: u32) -> io::Result<u32>;
                fn queue_close(&self, queue_id: u32);
                fn submit(
                    &self,
                    queue_id: u32,
                    commands: &[CommandTuple],
                    residency: &[ResidencyEntry],
                    in_syncs: &[u32],
                    out_sync: u32,
                    requirements: Requirements,
                ) -> io::Result<u32>;
                fn sync_new(&self, signaled: bool) -> io::Result<u32>;
                fn sync_close(&self, sync_id: u32);
                fn sync_wait(&self, sync_ids: &[u32], wait_all: bool, deadline_ns: i64) -> io::Result<WaitStatus>;
                fn sync_reset(&self, sync_ids: &[u32]) -> io::Result<()>;
                fn sync_export_file(&self, sync_id: u32) -> io::Result<OwnedFd>;
                fn sync_import_file(&self, sync_id: u32, fd: RawFd) -> io::Result<()>;
                fn sync_signal_from_timestamp(&self, queue_id: u32, timestamp: u32) -> io::Result<OwnedFd>;
                fn get_param(&self, param: Param) -> io::Result<u64>;
            }
        }

        const FRAMES: usize = 3;

        fn memfd() -> io::Result<OwnedFd> {
            let fd = unsafe { libc::memfd_create(b"timeline\0".as_ptr() as *const libc::c_char, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        }

        /// Driver whose submissions retire immediately, with signaled state
        /// shared between sync objects the way the kernel tracks it
        fn driver() -> MockDriver {
            let mut kgd = MockDriver::new();
            kgd.expect_name().return_const("scripted");
            kgd.expect_get_param().returning(|param| match param {
                Param::GpuId => Ok(660),
                Param::GmemSize => Ok(1 << 20),
                Param::GmemBase => Ok(0x10_0000),
                _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            });

            let next_handle = AtomicU32::new(1);
            kgd.expect_bo_new().returning(move |size, _| {
                let handle = next_handle.fetch_add(1, Ordering::Relaxed);
                Ok(NewBo {
                    handle,
                    gpu_addr: 0x1_0000_0000 + handle as u64 * 0x100_0000,
                    size,
                })
            });
            kgd.expect_bo_map().returning(|_, size| {
                let memory: &'static mut [u64] = Box::leak(vec![0u64; (size / 8) as usize].into_boxed_slice());
                Ok(NonNull::new(memory.as_mut_ptr() as *mut u8).unwrap())
            });
            kgd.expect_bo_munmap().returning(|_, _| ());
            kgd.expect_bo_madvise().returning(|_, _| Ok(true));
            kgd.expect_bo_close().returning(|_| ());
            kgd.expect_queue_new().returning(|_, _| Ok(3));
            kgd.expect_queue_close().returning(|_| ());

            let next_sync = AtomicU32::new(1);
            kgd.expect_sync_new()
                .returning(move |_| Ok(next_sync.fetch_add(1, Ordering::Relaxed)));
            kgd.expect_sync_close().returning(|_| ());

            let signaled = Arc::new(Mutex::new(HashSet::new()));
            let timestamps = AtomicU32::new(0);
            let on_submit = Arc::clone(&signaled);
            kgd.expect_submit().times(FRAMES).returning(move |_, _, _, _, out, _| {
                on_submit.lock().unwrap().insert(out);
                Ok(timestamps.fetch_add(1, Ordering::Relaxed))
            });
            kgd.expect_sync_signal_from_timestamp()
                .times(FRAMES)
                .returning(|_, _| memfd());
            let on_import = Arc::clone(&signaled);
            kgd.expect_sync_import_file().returning(move |id, _| {
                on_import.lock().unwrap().insert(id);
                Ok(())
            });
            let on_wait = Arc::clone(&signaled);
            kgd.expect_sync_wait().returning(move |ids, wait_all, _| {
                let set = on_wait.lock().unwrap();
                let met = if wait_all {
                    ids.iter().all(|id| set.contains(id))
                } else {
                    ids.iter().any(|id| set.contains(id))
                };
                Ok(if met { WaitStatus::Signaled } else { WaitStatus::TimedOut })
            });
            let on_reset = Arc::clone(&signaled);
            kgd.expect_sync_reset().returning(move |ids| {
                let mut set = on_reset.lock().unwrap();
                for id in ids {
                    set.remove(id);
                }
                Ok(())
            });
            kgd
        }

        #[test]
        fn test_frame_loop_reuses_buffer_and_fence() {
            let device = Device::new(Arc::new(driver()), DeviceConfig::default()).unwrap();
            let mut pool = device.create_command_pool().unwrap();
            let handle = pool.allocate(Level::Primary, 1).unwrap()[0];
            let mut queue = device.create_queue().unwrap();
            let fence = device.create_sync(false).unwrap();

            for _ in 0..FRAMES {
                let cb = pool.get_mut(handle).unwrap();
                cb.begin(UsageFlags::empty()).unwrap();
                cb.draw(3, 1, 0, 0);
                cb.end().unwrap();

                queue
                    .submit(&mut pool.get_many_mut(&[handle]).unwrap(), &[], Some(&fence))
                    .unwrap();
                wait_fences(&device, &[&fence], true, u64::MAX).unwrap();
                reset_fences(&device, &[&fence]).unwrap();
                assert!(!fence.is_signaled().unwrap());
            }

            let cb = pool.get_mut(handle).unwrap();
            assert_eq!(cb.refresh_status().unwrap(), Status::Executable);
            cb.reset().unwrap();
            assert_eq!(cb.status(), Status::Initial);
        }
    }
}
