//! End-to-end tests: hand-built IR modules in, emitted asm.js text out.

use crate::codegen::generate_module;
use crate::config::AsmJsConfig;
use crate::diagnostics::WarningKind;
use crate::ir::{
    BasicBlock, BinOp, BlockId, Callee, CastOp, Constant, FnAttrs, Function, FunctionType,
    GlobalVariable, InstKind, Instruction, Module, Operand, Param, Terminator, Type, ValueId,
};

fn int_ty() -> Type {
    Type::Int(32)
}

fn param(id: u32, name: &str, ty: Type) -> Param {
    Param {
        id: ValueId(id),
        name: Some(name.to_owned()),
        ty,
    }
}

fn inst(id: u32, name: Option<&str>, ty: Type, kind: InstKind) -> Instruction {
    Instruction {
        id: ValueId(id),
        name: name.map(str::to_owned),
        ty,
        kind,
        debug: None,
    }
}

fn block(id: u32, insts: Vec<Instruction>, term: Terminator) -> BasicBlock {
    BasicBlock {
        id: BlockId(id),
        insts,
        term,
    }
}

fn function(name: &str, params: Vec<Param>, ret: Type, blocks: Vec<BasicBlock>) -> Function {
    Function {
        name: name.to_owned(),
        params,
        ret,
        blocks,
        attrs: FnAttrs::default(),
        internal: false,
    }
}

fn module_with(functions: Vec<Function>, globals: Vec<GlobalVariable>) -> Module {
    let mut module = Module::new();
    module.functions = functions;
    module.globals = globals;
    module
}

fn generate(module: &Module) -> crate::codegen::AsmJsOutput {
    generate_module(module, AsmJsConfig::default()).expect("codegen should succeed")
}

fn value(id: u32) -> Operand {
    Operand::Value(ValueId(id))
}

fn const_i32(v: i32) -> Operand {
    Operand::Const(Constant::i32(v))
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[test]
fn minimal_function_adds_with_coercions() {
    let add = function(
        "add",
        vec![param(0, "a", int_ty()), param(1, "b", int_ty())],
        int_ty(),
        vec![block(
            0,
            vec![inst(
                2,
                Some("r"),
                int_ty(),
                InstKind::Binary {
                    op: BinOp::Add,
                    lhs: value(0),
                    rhs: value(1),
                },
            )],
            Terminator::Ret(Some(value(2))),
        )],
    );
    let out = generate(&module_with(vec![add], vec![]));
    assert!(out.source.contains("function _add($a,$b) {"));
    assert!(out.source.contains(" $a = $a|0;"));
    assert!(out.source.contains(" $b = $b|0;"));
    assert!(out.source.contains("$r = (($a) + ($b))|0;"));
    assert!(out.source.contains("return ($r|0);"));
    assert!(out.source.contains("\"implementedFunctions\""));
    assert!(out.source.contains("_add"));
}

#[test]
fn static_alloca_folds_to_stack_pointer() {
    let f = function(
        "f",
        vec![],
        int_ty(),
        vec![block(
            0,
            vec![
                inst(
                    0,
                    Some("p"),
                    Type::ptr_to(int_ty()),
                    InstKind::Alloca {
                        allocated: int_ty(),
                        count: const_i32(1),
                        align: 4,
                    },
                ),
                inst(
                    1,
                    None,
                    Type::Void,
                    InstKind::Store {
                        ptr: value(0),
                        value: const_i32(42),
                        align: 4,
                        volatile: false,
                    },
                ),
                inst(
                    2,
                    Some("v"),
                    int_ty(),
                    InstKind::Load {
                        ptr: value(0),
                        align: 4,
                        volatile: false,
                    },
                ),
            ],
            Terminator::Ret(Some(value(2))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains("$p = sp;"));
    assert!(out.source.contains("STACKTOP = STACKTOP + 16|0;"));
    assert!(out.source.contains("HEAP32[$p>>2] = 42;"));
    assert!(out.source.contains("$v = HEAP32[$p>>2]|0;"));
    assert!(out.source.contains("STACKTOP = sp;return ($v|0);"));
}

#[test]
fn indirect_call_masks_into_signature_table() {
    let callee_sig = FunctionType {
        ret: Type::Void,
        params: vec![int_ty()],
    };
    let h = function(
        "h",
        vec![param(0, "x", int_ty())],
        Type::Void,
        vec![block(0, vec![], Terminator::Ret(None))],
    );
    let caller = function(
        "caller",
        vec![
            param(0, "fp", Type::ptr_to(Type::Func(Box::new(callee_sig.clone())))),
            param(1, "a", int_ty()),
        ],
        int_ty(),
        vec![block(
            0,
            vec![
                inst(
                    2,
                    Some("idx"),
                    int_ty(),
                    InstKind::Cast {
                        op: CastOp::PtrToInt,
                        value: Operand::Const(Constant::Global("h".to_owned())),
                    },
                ),
                inst(
                    3,
                    None,
                    Type::Void,
                    InstKind::Call {
                        callee: Callee::Indirect {
                            pointer: value(0),
                            sig: callee_sig,
                        },
                        args: vec![value(1)],
                    },
                ),
            ],
            Terminator::Ret(Some(value(2))),
        )],
    );
    let out = generate(&module_with(vec![h, caller], vec![]));
    // `h` occupies slot 1 after the null sentinel; the table rounds to two
    // entries, so the mask is 1.
    assert!(out.source.contains("$idx = 1;"));
    assert!(out.source.contains("FUNCTION_TABLE_vi[$fp & 1]($a|0);"));
    assert!(out.source.contains("var FUNCTION_TABLE_vi = [0,_h];"));
}

#[test]
fn initialized_string_lands_in_memory_image() {
    let s = GlobalVariable {
        name: "s".to_owned(),
        ty: Type::array_of(Type::Int(8), 6),
        align: 1,
        init: Some(Constant::Str(b"hello\0".to_vec())),
        internal: false,
    };
    let f = function(
        "addr_of_s",
        vec![],
        int_ty(),
        vec![block(
            0,
            vec![inst(
                0,
                Some("addr"),
                int_ty(),
                InstKind::Cast {
                    op: CastOp::PtrToInt,
                    value: Operand::Const(Constant::Global("s".to_owned())),
                },
            )],
            Terminator::Ret(Some(value(0))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![s]));
    assert!(out
        .source
        .contains("allocate([104,101,108,108,111,0], \"i8\", ALLOC_NONE, Runtime.GLOBAL_BASE);"));
    // global_base defaults to 8 and the string needs no padding.
    assert!(out.source.contains("$addr = 8;"));
    assert!(out.source.contains("\"maxGlobalAlign\": 1"));
}

#[test]
fn phi_cycle_breaks_with_one_temporary() {
    let f = function(
        "swap",
        vec![],
        int_ty(),
        vec![
            block(0, vec![], Terminator::Br(BlockId(1))),
            block(
                1,
                vec![
                    inst(
                        0,
                        Some("x"),
                        int_ty(),
                        InstKind::Phi {
                            incoming: vec![(BlockId(0), value(1))],
                        },
                    ),
                    inst(
                        1,
                        Some("y"),
                        int_ty(),
                        InstKind::Phi {
                            incoming: vec![(BlockId(0), value(0))],
                        },
                    ),
                ],
                Terminator::Ret(Some(value(0))),
            ),
        ],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains("$x$phi = $y;$y = $x;$x = $x$phi;"));
}

#[test]
fn misaligned_i32_load_gathers_bytes() {
    let f = function(
        "f",
        vec![param(0, "p", Type::ptr_to(int_ty()))],
        int_ty(),
        vec![block(
            0,
            vec![inst(
                1,
                Some("v"),
                int_ty(),
                InstKind::Load {
                    ptr: value(0),
                    align: 1,
                    volatile: false,
                },
            )],
            Terminator::Ret(Some(value(1))),
        )],
    );
    let module = module_with(vec![f], vec![]);

    let out = generate(&module);
    assert!(out.source.contains(
        "$v = HEAPU8[$p>>0]|(HEAPU8[$p+1>>0]<<8)|(HEAPU8[$p+2>>0]<<16)|(HEAPU8[$p+3>>0]<<24);"
    ));
    assert!(!out
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::UnalignedAccess));

    let config = AsmJsConfig {
        warn_on_unaligned: true,
        ..AsmJsConfig::default()
    };
    let out = generate_module(&module, config).expect("codegen should succeed");
    assert!(out
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::UnalignedAccess));
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[test]
fn integer_multiply_peepholes() {
    let mul = |id: u32, name: &str, k: i32| {
        inst(
            id,
            Some(name),
            int_ty(),
            InstKind::Binary {
                op: BinOp::Mul,
                lhs: value(0),
                rhs: const_i32(k),
            },
        )
    };
    let add = |id: u32, name: &str, lhs: u32, rhs: u32| {
        inst(
            id,
            Some(name),
            int_ty(),
            InstKind::Binary {
                op: BinOp::Add,
                lhs: value(lhs),
                rhs: value(rhs),
            },
        )
    };
    let f = function(
        "muls",
        vec![param(0, "a", int_ty())],
        int_ty(),
        vec![block(
            0,
            vec![
                mul(1, "r0", 0),
                mul(2, "r1", 1),
                mul(3, "r2", 8),
                mul(4, "r3", 100),
                mul(5, "r4", 1048577),
                add(6, "s1", 1, 2),
                add(7, "s2", 6, 3),
                add(8, "s3", 7, 4),
                add(9, "s4", 8, 5),
            ],
            Terminator::Ret(Some(value(9))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains("$r0 = 0;"));
    assert!(out.source.contains("$r1 = $a;"));
    assert!(out.source.contains("$r2 = $a<<3;"));
    assert!(out.source.contains("$r3 = ($a*100)|0;"));
    assert!(out.source.contains("$r4 = Math_imul($a, 1048577)|0;"));
}

#[test]
fn switch_cases_to_one_destination_share_an_edge() {
    let f = function(
        "pick",
        vec![param(0, "c", int_ty())],
        int_ty(),
        vec![
            block(
                0,
                vec![],
                Terminator::Switch {
                    cond: value(0),
                    default: BlockId(2),
                    cases: vec![(1, BlockId(1)), (2, BlockId(1))],
                },
            ),
            block(1, vec![], Terminator::Ret(Some(const_i32(10)))),
            block(2, vec![], Terminator::Ret(Some(const_i32(20)))),
        ],
    );
    let out = generate(&module_with(vec![f], vec![]));
    // Both cases fall through to the same dispatch arm.
    assert!(out.source.contains("switch ($c|0)"));
    assert!(out.source.contains("case 2: case 1: "));
}

#[test]
fn emission_is_deterministic() {
    let f = function(
        "f",
        vec![param(0, "a", int_ty())],
        int_ty(),
        vec![block(
            0,
            vec![inst(
                1,
                Some("r"),
                int_ty(),
                InstKind::Binary {
                    op: BinOp::Mul,
                    lhs: value(0),
                    rhs: value(0),
                },
            )],
            Terminator::Ret(Some(value(1))),
        )],
    );
    let s = GlobalVariable {
        name: "s".to_owned(),
        ty: Type::array_of(Type::Int(8), 3),
        align: 1,
        init: Some(Constant::Str(b"ab\0".to_vec())),
        internal: false,
    };
    let module = module_with(vec![f], vec![s]);
    let first = generate(&module);
    let second = generate(&module);
    assert_eq!(first.source, second.source);
}

#[test]
fn misaligned_f64_load_gathers_through_temp_double_ptr() {
    let f = function(
        "f",
        vec![param(0, "p", Type::ptr_to(Type::Double))],
        Type::Double,
        vec![block(
            0,
            vec![inst(
                1,
                Some("v"),
                Type::Double,
                InstKind::Load {
                    ptr: value(0),
                    align: 4,
                    volatile: false,
                },
            )],
            Terminator::Ret(Some(value(1))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains(
        "HEAP32[tempDoublePtr>>2]=HEAP32[$p>>2];\
         HEAP32[tempDoublePtr+4>>2]=HEAP32[$p+4>>2];\
         $v = +HEAPF64[tempDoublePtr>>3];"
    ));
}

#[test]
fn sub_word_casts_use_shift_and_mask_forms() {
    let f = function(
        "f",
        vec![param(0, "a", int_ty())],
        int_ty(),
        vec![block(
            0,
            vec![
                inst(
                    1,
                    Some("t"),
                    Type::Int(8),
                    InstKind::Cast {
                        op: CastOp::Trunc,
                        value: value(0),
                    },
                ),
                inst(
                    2,
                    Some("s"),
                    int_ty(),
                    InstKind::Cast {
                        op: CastOp::SExt,
                        value: value(1),
                    },
                ),
                inst(
                    3,
                    Some("z"),
                    int_ty(),
                    InstKind::Cast {
                        op: CastOp::ZExt,
                        value: value(1),
                    },
                ),
                inst(
                    4,
                    Some("r"),
                    int_ty(),
                    InstKind::Binary {
                        op: BinOp::Add,
                        lhs: value(2),
                        rhs: value(3),
                    },
                ),
            ],
            Terminator::Ret(Some(value(4))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains("$t = $a&255;"));
    assert!(out.source.contains("$s = $t << 24 >> 24;"));
    assert!(out.source.contains("$z = $t&255;"));
}

#[test]
fn vector_add_uses_simd_and_flags_metadata() {
    let vec_ty = Type::vector_of(Type::Float, 4);
    let f = function(
        "f",
        vec![
            param(0, "x", vec_ty.clone()),
            param(1, "y", vec_ty.clone()),
        ],
        vec_ty.clone(),
        vec![block(
            0,
            vec![inst(
                2,
                Some("r"),
                vec_ty,
                InstKind::Binary {
                    op: BinOp::FAdd,
                    lhs: value(0),
                    rhs: value(1),
                },
            )],
            Terminator::Ret(Some(value(2))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains(" $x = SIMD_Float32x4_check($x);"));
    assert!(out.source.contains("$r = SIMD_Float32x4_add($x,$y);"));
    assert!(out.source.contains("var $r = SIMD_Float32x4(0,0,0,0)"));
    assert!(out.source.contains("\"simdFloat32x4\": 1"));
    assert!(out.source.contains("\"simd\": 1"));
}

// ============================================================================
// Module sections and diagnostics
// ============================================================================

#[test]
fn module_sections_appear_in_order() {
    let f = function(
        "f",
        vec![],
        Type::Void,
        vec![block(0, vec![], Terminator::Ret(None))],
    );
    let out = generate(&module_with(vec![f], vec![]));
    let start = out.source.find("// EMSCRIPTEN_START_FUNCTIONS").unwrap();
    let posts = out.source.find("function runPostSets()").unwrap();
    let end = out.source.find("// EMSCRIPTEN_END_FUNCTIONS").unwrap();
    let meminit = out.source.find("/* memory initializer */").unwrap();
    let metadata = out.source.find("// EMSCRIPTEN_METADATA").unwrap();
    assert!(start < posts && posts < end && end < meminit && meminit < metadata);
    assert!(out.source.contains("\"declares\""));
    assert!(out.source.contains("\"asmConstArities\""));
}

#[test]
fn post_sets_chunk_at_one_hundred() {
    let mut globals = vec![GlobalVariable {
        name: "ext".to_owned(),
        ty: int_ty(),
        align: 4,
        init: None,
        internal: false,
    }];
    for i in 0..105 {
        globals.push(GlobalVariable {
            name: format!("g{}", i),
            ty: int_ty(),
            align: 4,
            init: Some(Constant::Expr(Box::new(crate::ir::ConstExpr::PtrToInt(
                Constant::Global("ext".to_owned()),
            )))),
            internal: false,
        });
    }
    let out = generate(&module_with(vec![], globals));
    assert!(out.source.contains("function runPostSets() {"));
    assert!(out.source.contains(" runPostSets1();"));
    assert!(out.source.contains("function runPostSets1() {"));
    assert!(out.source.contains("\"externs\""));
    assert!(out.source.contains("_ext"));
}

#[test]
fn mismatched_target_triple_warns_but_proceeds() {
    let mut module = module_with(vec![], vec![]);
    module.target_triple = "wasm32-unknown-unknown".to_owned();
    let out = generate(&module);
    assert!(out
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::MismatchedTargetTriple));
}

#[test]
fn noncanonical_nan_literal_warns() {
    let weird_nan = f64::from_bits(0x7FF8_0000_0000_0001);
    let f = function(
        "f",
        vec![],
        Type::Double,
        vec![block(
            0,
            vec![],
            Terminator::Ret(Some(Operand::Const(Constant::Double(weird_nan)))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![]));
    assert!(out.source.contains("nan"));
    assert!(out
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::NoncanonicalNan));
}

#[test]
fn precise_f32_wraps_float_parameters() {
    let f = function(
        "f",
        vec![param(0, "x", Type::Float)],
        Type::Float,
        vec![block(0, vec![], Terminator::Ret(Some(value(0))))],
    );
    let module = module_with(vec![f], vec![]);

    let out = generate(&module);
    assert!(out.source.contains(" $x = +$x;"));

    let config = AsmJsConfig {
        precise_f32: true,
        ..AsmJsConfig::default()
    };
    let out = generate_module(&module, config).expect("codegen should succeed");
    assert!(out.source.contains(" $x = Math_fround($x);"));
}

#[test]
fn inline_js_call_registers_body_and_arity() {
    let code = GlobalVariable {
        name: "em_asm_code".to_owned(),
        ty: Type::array_of(Type::Int(8), 12),
        align: 1,
        init: Some(Constant::Str(b"out($0 | 0)\0".to_vec())),
        internal: true,
    };
    let f = function(
        "f",
        vec![param(0, "a", int_ty())],
        int_ty(),
        vec![block(
            0,
            vec![inst(
                1,
                Some("r"),
                int_ty(),
                InstKind::Call {
                    callee: Callee::Direct("emscripten_asm_const_int".to_owned()),
                    args: vec![
                        Operand::Const(Constant::Global("em_asm_code".to_owned())),
                        value(0),
                    ],
                },
            )],
            Terminator::Ret(Some(value(1))),
        )],
    );
    let out = generate(&module_with(vec![f], vec![code]));
    assert!(out.source.contains("$r = _emscripten_asm_const_0($a|0)|0;"));
    assert!(out.source.contains("\"asmConsts\""));
    assert!(out.source.contains("out($0 | 0)"));
    assert!(out.source.contains("emscripten_asm_const_0"));
}

#[test]
fn relocatable_without_emulated_pointers_is_rejected() {
    let module = module_with(vec![], vec![]);
    let config = AsmJsConfig {
        relocatable: true,
        global_base: 0,
        ..AsmJsConfig::default()
    };
    assert!(generate_module(&module, config).is_err());
}

#[test]
fn unused_side_effect_call_emits_without_assignment() {
    let puts = function("puts", vec![param(0, "s", int_ty())], int_ty(), vec![]);
    let f = function(
        "f",
        vec![],
        Type::Void,
        vec![block(
            0,
            vec![inst(
                0,
                None,
                int_ty(),
                InstKind::Call {
                    callee: Callee::Direct("puts".to_owned()),
                    args: vec![const_i32(0)],
                },
            )],
            Terminator::Ret(None),
        )],
    );
    let out = generate(&module_with(vec![puts, f], vec![]));
    assert!(out.source.contains("_puts(0);"));
    assert!(!out.source.contains("= _puts"));
    // The declaration lands in metadata.
    assert!(out.source.contains("\"puts\""));
}
