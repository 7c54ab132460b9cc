use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dnnrt_core::{Buffer, DType, DnnError, Graph, Session, SharedTensor, Tensor};
use parking_lot::Mutex;

use crate::{Interpreter, Lifecycle, Result, ScriptEngine, ScriptError, ScriptHost, ScriptValue};

/// Emulates a host that has the vocabulary loaded, serving a graph with
/// `input[-1, 10] -> output = sum(input) + 1`.
#[derive(Default)]
struct MockHost {
    calls: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    inputs: Mutex<Vec<String>>,
    outputs: Mutex<Vec<String>>,
    bad_listing: bool,
}

impl MockHost {
    fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == name).count()
    }

    fn eval(&self, arrays: Vec<ScriptValue>) -> Result<ScriptValue> {
        let inputs = self.inputs.lock().clone();
        if inputs.len() != arrays.len() {
            return Err(ScriptError::call("eval_session", "input count mismatch"));
        }
        let mut fed = Vec::new();
        for (name, value) in inputs.into_iter().zip(arrays) {
            fed.push((name, value.into_array("input")?));
        }
        let lookup = |port: &str| fed.iter().find(|(n, _)| n == port).map(|(_, b)| b);

        let mut results = Vec::new();
        for port in self.outputs.lock().iter() {
            let input = lookup("input:0").ok_or_else(|| {
                ScriptError::call("eval_session", "You must feed a value for input:0")
            })?;
            let value = match port.as_str() {
                "input:0" => input.clone(),
                "output:0" => {
                    let x = input
                        .as_slice::<f32>()
                        .ok_or_else(|| ScriptError::call("eval_session", "input is not float32"))?;
                    let rows: Vec<f32> = x.chunks(10).map(|r| r.iter().sum::<f32>() + 1.0).collect();
                    let n = rows.len();
                    Buffer::from_vec(&[n, 1], rows)
                        .map_err(|e| ScriptError::call("eval_session", e.to_string()))?
                }
                other => return Err(ScriptError::call("eval_session", format!("unknown {other}"))),
            };
            results.push(ScriptValue::Array(value));
        }
        Ok(ScriptValue::Tuple(results))
    }
}

impl ScriptHost for MockHost {
    fn run_script(&self, code: &str) -> Result<()> {
        if code.contains("raise") {
            return Err(ScriptError::Script("SyntaxError".into()));
        }
        self.scripts.lock().push(code.to_string());
        Ok(())
    }

    fn call(&self, name: &str, args: ScriptValue) -> Result<ScriptValue> {
        let args = args.into_tuple(name)?;
        self.calls.lock().push(name.to_string());
        match name {
            "load_graph" => {
                if self.bad_listing {
                    return Ok(ScriptValue::Tuple(vec![ScriptValue::Int(1)]));
                }
                let entry = |n: &str, k: i64| ScriptValue::Tuple(vec![n.into(), k.into()]);
                Ok(ScriptValue::Tuple(vec![
                    entry("input", 1),
                    entry("output", 1),
                    entry("init", 0),
                ]))
            }
            "start_session" => Ok(ScriptValue::None),
            "define_inputs" => {
                *self.inputs.lock() = strings(&args);
                Ok(ScriptValue::None)
            }
            "define_outputs" => {
                *self.outputs.lock() = strings(&args);
                Ok(ScriptValue::None)
            }
            "eval_session" => {
                let arrays = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| ScriptError::call(name, "missing inputs"))?
                    .into_tuple("inputs")?;
                self.eval(arrays)
            }
            other => Err(ScriptError::call(other, "name is not defined")),
        }
    }
}

fn strings(args: &[ScriptValue]) -> Vec<String> {
    args.iter().filter_map(|a| a.as_str().map(str::to_string)).collect()
}

fn script_graph(host: &Arc<MockHost>) -> Graph {
    let engine = ScriptEngine::new(host.clone()).with_bootstrap("def load_graph(path): ...");
    Graph::from_source(Arc::new(engine), "models/simplegraph").unwrap()
}

fn range_input() -> SharedTensor {
    let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
    SharedTensor::new(Tensor::from_vec(&[1, 10], data).unwrap())
}

#[test]
fn hello_world_through_script_host() {
    let host = Arc::new(MockHost::default());
    let graph = script_graph(&host);
    assert_eq!(graph.operation_names(), vec!["input", "output", "init"]);
    assert_eq!(host.scripts.lock().len(), 1);

    let mut session = Session::from_graph(&graph).unwrap();
    let input = range_input();
    let output = SharedTensor::empty();
    session.add_input(&input, "input", 0).unwrap();
    session.add_output(&output, "output", 0).unwrap();
    session.run().unwrap();

    let out = output.read();
    assert_eq!(out.shape().unwrap(), &[1, 1]);
    assert_eq!(out.dtype().unwrap(), DType::Float32);
    assert_eq!(out.get::<f32>(&[0, 0]).unwrap(), 46.0);
    assert_eq!(host.count("start_session"), 1);
}

#[test]
fn port_definitions_are_sent_only_on_change() {
    let host = Arc::new(MockHost::default());
    let graph = script_graph(&host);
    let mut session = Session::from_graph(&graph).unwrap();
    let input = range_input();
    let output = SharedTensor::empty();
    session.add_input(&input, "input", 0).unwrap();
    session.add_output(&output, "output", 0).unwrap();

    for _ in 0..3 {
        session.run().unwrap();
    }
    assert_eq!(host.count("eval_session"), 3);
    assert_eq!(host.count("define_inputs"), 1);
    assert_eq!(host.count("define_outputs"), 1);

    let other = SharedTensor::empty();
    session.add_output(&other, "input", 0).unwrap();
    session.run().unwrap();
    assert_eq!(host.count("define_inputs"), 1);
    assert_eq!(host.count("define_outputs"), 2);
    assert_eq!(*host.outputs.lock(), vec!["output:0", "input:0"]);
    assert_eq!(other.read().as_slice::<f32>().unwrap(), input.read().as_slice::<f32>().unwrap());
}

#[test]
fn binding_checks_hold_for_script_backend() {
    let host = Arc::new(MockHost::default());
    let graph = script_graph(&host);
    let mut session = Session::from_graph(&graph).unwrap();
    let input = range_input();

    session.add_input(&input, "input", 0).unwrap();
    let err = session.add_input(&input, "input", 0).unwrap_err();
    assert!(matches!(err, DnnError::InvalidInput(_)));

    let err = session.add_input(&SharedTensor::empty(), "input", 0).unwrap_err();
    assert!(matches!(err, DnnError::InvalidTensor(_)));

    let err = session.add_output(&SharedTensor::empty(), "missing", 0).unwrap_err();
    assert!(matches!(err, DnnError::InvalidOperation(_)));
}

#[test]
fn failed_evaluation_leaves_outputs_empty() {
    let host = Arc::new(MockHost::default());
    let graph = script_graph(&host);
    let mut session = Session::from_graph(&graph).unwrap();
    let output = SharedTensor::new(Tensor::zeros(DType::Float32, &[1, 1]).unwrap());
    session.add_output(&output, "output", 0).unwrap();

    let err = session.run().unwrap_err();
    assert!(matches!(err, DnnError::InvalidSession(_)));
    assert!(err.to_string().contains("input:0"));
    assert!(output.read().is_empty());
}

#[test]
fn stateless_runs_share_the_host() {
    let host = Arc::new(MockHost::default());
    let graph = script_graph(&host);
    let session = Session::from_graph(&graph).unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let session = &session;
            s.spawn(move || {
                let input = SharedTensor::new(Tensor::zeros(DType::Float32, &[2, 10]).unwrap());
                input.write().fill(t as f32).unwrap();
                let output = SharedTensor::empty();
                let inputs = [session.create_io(&input, "input", 0).unwrap()];
                let outputs = [session.create_io(&output, "output", 0).unwrap()];
                for _ in 0..5 {
                    session.run_with(&inputs, &outputs).unwrap();
                    let expected = 10.0 * t as f32 + 1.0;
                    assert_eq!(output.read().as_slice::<f32>().unwrap(), &[expected, expected]);
                }
            });
        }
    });
    assert_eq!(host.count("eval_session"), 20);
}

#[test]
fn only_path_sources_load() {
    let host = Arc::new(MockHost::default());
    let engine = Arc::new(ScriptEngine::new(host.clone()));
    let err = Graph::from_source(engine, b"{}".to_vec()).unwrap_err();
    assert!(matches!(err, DnnError::InvalidGraph(_)));
    assert!(err.to_string().contains("paths only"));
    assert_eq!(host.count("load_graph"), 0);
}

#[test]
fn bootstrap_failure_fails_load() {
    let host = Arc::new(MockHost::default());
    let engine = ScriptEngine::new(host.clone()).with_bootstrap("raise RuntimeError()");
    let err = Graph::from_source(Arc::new(engine), "models/simplegraph").unwrap_err();
    assert!(matches!(err, DnnError::InvalidGraph(_)));
    assert!(err.to_string().contains("SyntaxError"));
}

#[test]
fn malformed_listing_fails_load() {
    let host = Arc::new(MockHost {
        bad_listing: true,
        ..MockHost::default()
    });
    let engine = ScriptEngine::new(host);
    let err = Graph::from_source(Arc::new(engine), "models/simplegraph").unwrap_err();
    assert!(matches!(err, DnnError::InvalidGraph(_)));
    assert!(err.to_string().contains("n_outputs"));
}

#[derive(Default)]
struct FlagInterpreter(AtomicBool);

impl Interpreter for FlagInterpreter {
    fn initialize(&self) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        self.0.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn graphs_and_sessions_hold_the_interpreter() {
    let interp = Arc::new(FlagInterpreter::default());
    let lifecycle = Lifecycle::new(interp.clone());
    let host = Arc::new(MockHost::default());
    let engine = ScriptEngine::new(host).with_lifecycle(lifecycle.clone());

    let graph = Graph::from_source(Arc::new(engine), "models/simplegraph").unwrap();
    assert!(interp.is_initialized());
    assert_eq!(lifecycle.consumers(), 1);

    let mut session = Session::from_graph(&graph).unwrap();
    assert_eq!(lifecycle.consumers(), 2);

    session.reset().unwrap();
    assert_eq!(lifecycle.consumers(), 1);
    assert!(interp.is_initialized());

    drop(session);
    drop(graph);
    assert_eq!(lifecycle.consumers(), 0);
    assert!(!interp.is_initialized());
}
