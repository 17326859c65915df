//! Executor behavior over loopback and TCP sessions

use std::collections::BTreeMap;
use std::time::Duration;

use rexec_core::compiler::{build, BuildOptions, Computation, ComputationBuilder, StandardCompiler};
use rexec_core::{
    Comparator, ConnectionParams, DType, DeviceConfig, Dim, Error, Executor, ExecutorKind, HostTensor, Location, Session, TargetDescriptor,
};
use rexec_device::DeviceServer;

fn accel() -> TargetDescriptor {
    TargetDescriptor::accelerator("v68")
}

fn add_scaled() -> Computation {
    let mut b = ComputationBuilder::new("add_scaled");
    let x = b.static_input("x", DType::F32, &[3]);
    let y = b.static_input("y", DType::F32, &[3]);
    let sum = b.add(&x, &y);
    let out = b.multiply(&sum, &x);
    b.output(&out);
    b.build().unwrap()
}

fn f32s(values: &[f32]) -> HostTensor {
    HostTensor::from_slice(vec![values.len()], values).unwrap()
}

fn read(session: &Session, buffer: &rexec_core::TensorBuffer) -> Vec<f32> {
    session.copy_out(buffer).unwrap().to_vec::<f32>().unwrap()
}

#[test]
fn test_aot_unbound_input_fails_locally() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Aot)).unwrap();
    let mut executor = session.stage(&artifact).unwrap();
    let x = session.copy_in(&f32s(&[1.0, 2.0, 3.0])).unwrap();
    executor.set_input("x", &x).unwrap();

    let before = session.stats();
    assert!(matches!(executor.run(), Err(Error::UnboundInput(name)) if name == "y"));
    assert!(matches!(executor.get_outputs(), Err(Error::OutputUnavailable(_))));
    assert_eq!(session.stats(), before);
}

#[test]
fn test_binding_errors_never_reach_the_device() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Graph)).unwrap();
    let mut executor = session.stage(&artifact).unwrap();
    let wrong_shape = session.copy_in(&f32s(&[1.0, 2.0])).unwrap();
    let wrong_dtype = session.copy_in(&HostTensor::zeros(vec![3], DType::I32)).unwrap();

    let before = session.stats();
    assert!(matches!(executor.set_input("z", &wrong_shape), Err(Error::UnknownInput(_))));
    assert!(matches!(executor.set_input(5, &wrong_shape), Err(Error::UnknownInput(_))));
    assert!(matches!(executor.set_input("x", &wrong_shape), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(executor.set_input("y", &wrong_dtype), Err(Error::ShapeMismatch { .. })));
    assert_eq!(session.stats(), before);
}

#[test]
fn test_graph_positional_binding_leaves_parameters_bound() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let reference = Session::open(ConnectionParams::loopback_host()).unwrap();
    let mut b = ComputationBuilder::new("scaled_add");
    let x = b.static_input("x", DType::F32, &[3]);
    let y = b.static_input("y", DType::F32, &[3]);
    let scale = b.param("scale", DType::F32, &[3]);
    let scaled = b.multiply(&x, &scale);
    let out = b.add(&scaled, &y);
    b.output(&out);
    let computation = b.build().unwrap();

    let options = BuildOptions::new(ExecutorKind::Graph).with_param("scale", f32s(&[2.0, 3.0, 4.0]));
    let mut executor = session.stage(&build(&computation, &accel(), &options).unwrap()).unwrap();
    assert_eq!(executor.num_inputs().unwrap(), 2);
    assert!(executor.input_names().unwrap().iter().any(|name| name == "scale"));

    let xs = session.copy_in(&f32s(&[1.0, 1.0, 1.0])).unwrap();
    let ys = session.copy_in(&f32s(&[0.5, 0.0, -1.0])).unwrap();
    assert!(matches!(executor.set_positional(&[&xs]), Err(Error::ShapeMismatch { .. })));
    executor.set_positional(&[&xs, &ys]).unwrap();
    executor.run().unwrap();
    assert_eq!(read(&session, executor.get_output(0).unwrap()), vec![2.5, 3.0, 3.0]);

    let mut host = reference
        .stage(&build(&computation, &TargetDescriptor::host_cpu(), &options).unwrap())
        .unwrap();
    let inputs = [f32s(&[1.0, -2.0, 0.25]), f32s(&[4.0, 4.0, 4.0])];
    let result = Comparator::default().compare(&mut executor, &mut host, &inputs).unwrap();
    assert!(result.passed(), "{result}");
    assert_eq!(
        session.copy_out(executor.get_output(0).unwrap()).unwrap().to_vec::<f32>().unwrap(),
        vec![6.0, -2.0, 5.0]
    );
}

#[test]
fn test_graph_rebind_uses_only_the_new_binding() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Graph)).unwrap();
    let mut executor = session.stage(&artifact).unwrap();
    let x = session.copy_in(&f32s(&[1.0, 2.0, 3.0])).unwrap();
    let y1 = session.copy_in(&f32s(&[1.0, 1.0, 1.0])).unwrap();
    let y2 = session.copy_in(&f32s(&[0.0, -2.0, 10.0])).unwrap();

    executor.set_inputs([("x", &x), ("y", &y1)]).unwrap();
    executor.run().unwrap();
    let first = executor.get_output(0).unwrap().clone();
    assert_eq!(read(&session, &first), vec![2.0, 6.0, 12.0]);

    executor.set_input("y", &y2).unwrap();
    executor.run().unwrap();
    assert_eq!(read(&session, executor.get_output(0).unwrap()), vec![1.0, 0.0, 39.0]);
    // Graph outputs are fresh per run; the earlier result is untouched.
    assert!(!first.same_allocation(executor.get_output(0).unwrap()));
    assert_eq!(read(&session, &first), vec![2.0, 6.0, 12.0]);
}

#[test]
fn test_graph_run_with_keyword_inputs() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Graph)).unwrap();
    let mut executor = session.stage(&artifact).unwrap();
    let x = session.copy_in_to(&f32s(&[1.0, 2.0, 3.0]), Location::DeviceScratch).unwrap();
    let y = session.copy_in_to(&f32s(&[1.0, 1.0, 1.0]), Location::Host).unwrap();
    let Executor::Graph(graph) = &mut executor else {
        panic!("expected a graph executor");
    };
    graph.run_with([("x", &x), ("y", &y)]).unwrap();
    assert_eq!(read(&session, executor.get_output(0).unwrap()), vec![2.0, 6.0, 12.0]);
}

#[test]
fn test_runtime_faults_clear_outputs() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let mut b = ComputationBuilder::new("dyn_matmul");
    let x = b.input("x", DType::F32, vec![Dim::symbolic("m"), Dim::symbolic("n")]);
    let y = b.matmul(&x, &x);
    b.output(&y);
    let artifact = build(&b.build().unwrap(), &accel(), &BuildOptions::new(ExecutorKind::Vm)).unwrap();
    let mut executor = session.stage(&artifact).unwrap();

    let square = session.copy_in(&HostTensor::random(vec![4, 4], DType::F32, 1)).unwrap();
    executor.set_input("x", &square).unwrap();
    executor.run().unwrap();
    assert!(executor.get_output(0).is_ok());

    // Symbolic dims are consistent, but the kernel needs n == m.
    let wide = session.copy_in(&HostTensor::random(vec![2, 3], DType::F32, 2)).unwrap();
    executor.set_input("x", &wide).unwrap();
    assert!(matches!(executor.run(), Err(Error::RuntimeExecution(_))));
    assert!(matches!(executor.get_output(0), Err(Error::OutputUnavailable(_))));

    // The session survives a device fault.
    executor.set_input("x", &square).unwrap();
    executor.run().unwrap();
}

#[test]
fn test_vm_entry_points_and_keyword_calls() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let mut b = ComputationBuilder::new("scale");
    let x = b.input("x", DType::F32, vec![Dim::symbolic("n")]);
    let k = b.param("k", DType::F32, &[1]);
    let y = b.multiply(&x, &k);
    b.output(&y);
    let scale = b.build().unwrap();

    let mut b = ComputationBuilder::new("shift");
    let x = b.input("x", DType::F32, vec![Dim::symbolic("n")]);
    let y = b.input("y", DType::F32, vec![Dim::symbolic("n")]);
    let k = b.param("k", DType::F32, &[1]);
    let sum = b.add(&x, &y);
    let out = b.add(&sum, &k);
    b.output(&out);
    let shift = b.build().unwrap();

    let params = BTreeMap::from([("k".to_string(), f32s(&[2.0]))]);
    let artifact = StandardCompiler::new()
        .compile_vm_entries(&[("main", &scale), ("shift", &shift)], &accel(), &params)
        .unwrap();
    let mut executor = session.stage(&artifact).unwrap();
    let vm = executor.as_vm_mut().unwrap();
    assert_eq!(vm.entry_names().collect::<Vec<_>>(), vec!["main", "shift"]);

    let a = session.copy_in(&f32s(&[1.0, 2.0, 3.0])).unwrap();
    let b5 = session.copy_in(&f32s(&[10.0, 20.0, 30.0, 40.0, 50.0])).unwrap();
    let outputs = vm.invoke("main", &[&a]).unwrap();
    assert_eq!(read(&session, &outputs[0]), vec![2.0, 4.0, 6.0]);
    let outputs = vm.invoke("main", &[&b5]).unwrap();
    assert_eq!(outputs[0].shape(), &[5]);

    let outputs = vm.invoke_named("shift", [("y", &a), ("x", &a)]).unwrap();
    assert_eq!(read(&session, &outputs[0]), vec![4.0, 6.0, 8.0]);
    assert!(matches!(vm.invoke_named("shift", [("x", &a)]), Err(Error::UnboundInput(name)) if name == "y"));
    assert!(matches!(
        vm.invoke_named("shift", [("x", &a), ("y", &b5)]),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(vm.invoke("missing", &[&a]), Err(Error::UnknownEntryPoint(_))));

    executor.run_entry("shift").unwrap_err();
    assert!(matches!(executor.run_entry("nope"), Err(Error::UnknownEntryPoint(_))));
}

#[test]
fn test_staging_for_another_target_fails() {
    let session = Session::open(ConnectionParams::loopback_host()).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Graph)).unwrap();
    assert!(matches!(session.stage(&artifact), Err(Error::Staging(_))));
    // The session is still usable.
    let host = build(&add_scaled(), &TargetDescriptor::host_cpu(), &BuildOptions::new(ExecutorKind::Graph)).unwrap();
    session.stage(&host).unwrap();
}

#[test]
fn test_module_reuse_shares_one_staging() {
    let session = Session::open(ConnectionParams::loopback("v68").with_module_reuse(true)).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Aot)).unwrap();
    let first = session.stage(&artifact).unwrap();
    let before = session.stats();
    let second = session.stage(&artifact).unwrap();
    // Only the second executor's output allocation reaches the device.
    assert_eq!(session.stats().round_trips, before.round_trips + 1);
    drop((first, second));
}

#[test]
fn test_tcp_matches_loopback() {
    let server = DeviceServer::bind("127.0.0.1:0", DeviceConfig::accelerator("v68")).unwrap();
    let addr = server.local_addr().unwrap();
    let _server = server.spawn();

    let params = ConnectionParams::tcp(addr.to_string()).with_io_timeout(Duration::from_secs(10));
    let tcp = Session::open(params).unwrap();
    let loopback = Session::open(ConnectionParams::loopback("v68")).unwrap();
    assert_eq!(tcp.device_info(), loopback.device_info());

    let inputs = [
        HostTensor::random(vec![3], DType::F32, 3),
        HostTensor::random(vec![3], DType::F32, 4),
    ];
    let mut results = Vec::new();
    for session in [&tcp, &loopback] {
        let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Vm)).unwrap();
        let mut executor = session.stage(&artifact).unwrap();
        let x = session.copy_in(&inputs[0]).unwrap();
        let y = session.copy_in(&inputs[1]).unwrap();
        executor.set_positional(&[&x, &y]).unwrap();
        executor.run().unwrap();
        results.push(session.copy_out(executor.get_output(0).unwrap()).unwrap());
    }
    assert_eq!(results[0], results[1]);
    tcp.close();
}

#[test]
fn test_unreachable_tcp_endpoint() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let params = ConnectionParams::tcp(addr.to_string()).with_connect_timeout(Duration::from_millis(200));
    assert!(matches!(Session::open(params), Err(Error::Connection(_))));
}

#[test]
fn test_everything_fails_after_close() {
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let artifact = build(&add_scaled(), &accel(), &BuildOptions::new(ExecutorKind::Graph)).unwrap();
    let mut executor = session.stage(&artifact).unwrap();
    let x = session.copy_in(&f32s(&[1.0, 2.0, 3.0])).unwrap();
    executor.set_inputs([("x", &x), ("y", &x)]).unwrap();
    executor.run().unwrap();

    session.close();
    session.close();
    assert!(session.is_closed());
    assert!(matches!(session.copy_in(&f32s(&[1.0])), Err(Error::SessionClosed)));
    assert!(matches!(session.copy_out(&x), Err(Error::SessionClosed)));
    assert!(matches!(session.stage(&artifact), Err(Error::SessionClosed)));
    assert!(matches!(executor.run(), Err(Error::SessionClosed)));
    assert!(matches!(executor.get_output(0), Err(Error::SessionClosed)));
    drop(x);
    drop(executor);
}
