//! End-to-end runs over in-memory workbooks.

use calamine::Data;
use chrono::NaiveDate;
use parser::extract::InMemorySheets;
use parser::period::TagContext;
use parser::{map_with_registry, ConsolidatedTable, FamilyRegistry, Pipeline, RunReport};

fn s(v: &str) -> Data {
    Data::String(v.to_string())
}

fn ymd(y: i32, m: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, 1).unwrap()
}

/// Registry restricted to the named builtin families.
fn registry(names: &[&str]) -> FamilyRegistry {
    let builtin = FamilyRegistry::builtin();
    let families = names
        .iter()
        .map(|name| builtin.get(name).unwrap().clone())
        .collect();
    FamilyRegistry::new(families).unwrap()
}

/// Credit sheet: title block, header on row 5, banks from row 6.
/// Columns B (entity), E (balance), H (IMOR), K (ICOR), N (expected loss).
fn credit_sheet(banks: &[(&str, f64)]) -> Vec<Vec<Data>> {
    let width = 14;
    let mut rows = vec![vec![Data::Empty; width]; 4];
    rows[0][1] = s("Comisión Nacional Bancaria y de Valores");
    rows[1][1] = s("Cartera de crédito");

    let mut header = vec![Data::Empty; width];
    header[1] = s("Institución");
    header[4] = s("Cartera total");
    header[7] = s("IMOR");
    rows.push(header);

    for (entity, balance) in banks {
        let mut row = vec![Data::Empty; width];
        row[1] = s(entity);
        row[4] = Data::Float(*balance);
        row[7] = Data::Float(2.5);
        row[10] = Data::Float(120.0);
        row[13] = s("n.a.");
        rows.push(row);
    }
    rows
}

fn workbook(name: &str, sheet: &str, banks: &[(&str, f64)]) -> InMemorySheets {
    InMemorySheets::new(name).with_sheet(sheet, credit_sheet(banks))
}

fn run(registry: &FamilyRegistry, sources: &mut [InMemorySheets]) -> (Vec<parser::pipeline::FamilyOutput>, RunReport) {
    let tag = TagContext::now();
    let mut report = RunReport::new(tag.ingested_at);
    let outputs = Pipeline::new(registry, tag).run(sources, &mut report);
    (outputs, report)
}

// -------------------------------------------------------------------------
// CONSOLIDATION ACROSS MONTHS
// -------------------------------------------------------------------------

#[test]
fn test_two_months_consolidate_in_file_order() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![
        workbook("cnbv_boletin_banca_multiple_2023_01.xlsx", "CCT", &[("BankX", 50.0)]),
        workbook("cnbv_boletin_banca_multiple_2023_02.xlsx", "CCT", &[("BankX", 60.0)]),
    ];
    let (outputs, report) = run(&registry, &mut sources);

    assert!(report.skipped.is_empty(), "{:?}", report.skipped);
    assert_eq!(outputs.len(), 1);
    let table = &outputs[0].table;
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[0].period, ymd(2023, 1));
    assert_eq!(table.rows[1].period, ymd(2023, 2));
    assert_eq!(table.rows[0].entity, "BankX");
    // ICOR read; expected-loss placeholder coerced to zero
    assert_eq!(table.rows[0].values, vec![50.0, 2.5, 120.0, 0.0]);

    let facts = &outputs[0].facts;
    assert_eq!(facts.len(), 2);
    assert!(facts.iter().all(|f| f.indicator_id == 28));
    assert!(facts.iter().all(|f| f.credit_type.as_deref() == Some("Total")));
    assert_eq!(facts[0].value, 50.0);
    assert_eq!(facts[1].value, 60.0);

    assert_eq!(report.families[0].files, 2);
    assert_eq!(report.families[0].rows, 2);
    assert_eq!(report.families[0].facts, 2);
}

#[test]
fn test_same_sheet_feeds_balance_and_imor_families() {
    let registry = registry(&["cartera", "imor_cartera"]);
    let mut sources = vec![workbook("BE BM 202506.xlsx", "CCT", &[("BankX", 50.0), ("BankY", 10.0)])];
    let (outputs, _) = run(&registry, &mut sources);

    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[1].table.family, "imor_cartera");
    assert_eq!(outputs[1].table.fields, vec!["IMORTotal"]);
    let imor = &outputs[1].facts;
    assert_eq!(imor.len(), 2);
    assert!(imor.iter().all(|f| f.indicator_id == 29 && f.value == 2.5));
    assert_eq!(imor[0].period, ymd(2025, 6));
}

// -------------------------------------------------------------------------
// ROW CLEANING
// -------------------------------------------------------------------------

#[test]
fn test_system_aggregate_survives_structural_rows_do_not() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![workbook(
        "b_2024_03.xlsx",
        "CCT",
        &[
            ("BankX", 50.0),
            ("Sistema */", 500.0),
            ("TOTAL SISTEMA", 500.0),
            ("Notas: cifras en millones de pesos", 0.0),
            ("Fuente: CNBV", 0.0),
        ],
    )];
    let (outputs, _) = run(&registry, &mut sources);

    let entities: Vec<&str> = outputs[0]
        .table
        .rows
        .iter()
        .map(|r| r.entity.as_str())
        .collect();
    assert_eq!(entities, vec!["BankX", "Sistema"]);
}

#[test]
fn test_sheet_with_only_structural_rows_is_no_data() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![workbook("b_2024_03.xlsx", "CCT", &[("Total", 1.0), ("Notas", 0.0)])];
    let (outputs, report) = run(&registry, &mut sources);

    assert!(outputs.is_empty());
    assert_eq!(report.no_data, vec!["cartera"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].kind, "empty");
}

#[test]
fn test_repeated_heading_mid_sheet_is_dropped() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![workbook(
        "b_2024_03.xlsx",
        "CCT",
        &[("BankX", 50.0), ("Institución", 0.0), ("BankY", 40.0)],
    )];
    let (outputs, _) = run(&registry, &mut sources);

    let entities: Vec<&str> = outputs[0].table.rows.iter().map(|r| r.entity.as_str()).collect();
    assert_eq!(entities, vec!["BankX", "BankY"]);
    assert!(outputs[0].facts.iter().all(|f| f.entity != "Institución"));
}

// -------------------------------------------------------------------------
// SKIP AND CONTINUE
// -------------------------------------------------------------------------

#[test]
fn test_undated_file_with_empty_sheet_reports_period() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![workbook("boletin_sin_fecha.xlsx", "CCT", &[("Total", 1.0), ("Notas", 0.0)])];
    let (outputs, report) = run(&registry, &mut sources);

    assert!(outputs.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].kind, "period_format");
}

#[test]
fn test_missing_period_excludes_file_from_every_family() {
    let registry = registry(&["cartera", "imor_cartera"]);
    let mut sources = vec![
        workbook("boletin_sin_fecha.xlsx", "CCT", &[("BankX", 1.0)]),
        workbook("boletin_2024_01.xlsx", "CCT", &[("BankX", 2.0)]),
    ];
    let (outputs, report) = run(&registry, &mut sources);

    assert_eq!(outputs.len(), 2);
    for output in &outputs {
        assert_eq!(output.table.rows.len(), 1);
        assert_eq!(output.table.rows[0].period, ymd(2024, 1));
    }
    assert_eq!(report.skipped.len(), 2);
    assert!(report.skipped.iter().all(|s| s.kind == "period_format"));
    assert!(report
        .skipped
        .iter()
        .all(|s| s.file.to_string_lossy() == "boletin_sin_fecha.xlsx"));
}

#[test]
fn test_missing_sheet_is_recorded_and_others_continue() {
    let registry = registry(&["vivienda", "cartera"]);
    let mut sources = vec![workbook("boletin_2024_01.xlsx", "CCT", &[("BankX", 2.0)])];
    let (outputs, report) = run(&registry, &mut sources);

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].table.family, "cartera");
    assert_eq!(report.no_data, vec!["vivienda"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].family, "vivienda");
    assert_eq!(report.skipped[0].kind, "source_format");
}

#[test]
fn test_builtin_registry_on_partial_workbook() {
    let registry = FamilyRegistry::builtin();
    let mut sources = vec![workbook("boletin_2024_01.xlsx", "CCV", &[("BankX", 2.0)])];
    let (outputs, report) = run(&registry, &mut sources);

    let families: Vec<&str> = outputs.iter().map(|o| o.table.family.as_str()).collect();
    assert_eq!(families, vec!["vivienda", "imor_vivienda"]);
    assert_eq!(report.no_data.len(), registry.len() - 2);
    assert_eq!(report.skipped.len(), registry.len() - 2);
}

#[test]
fn test_duplicate_source_is_reported_and_facts_deduplicated() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![
        workbook("boletin_2024_01.xlsx", "CCT", &[("BankX", 2.0)]),
        workbook("copia/boletin_2024_01.xlsx", "CCT", &[("BankX", 2.0)]),
    ];
    let (outputs, report) = run(&registry, &mut sources);

    assert_eq!(outputs[0].table.rows.len(), 2);
    assert_eq!(report.duplicate_keys.len(), 1);
    assert_eq!(report.duplicate_keys[0].entity, "BankX");
    assert_eq!(outputs[0].facts.len(), 1);
    assert_eq!(report.families[0].duplicate_facts, 1);
}

// -------------------------------------------------------------------------
// DEPOSITS
// -------------------------------------------------------------------------

#[test]
fn test_builtin_deposits_emit_four_labels_per_bank() {
    let registry = registry(&["captacion"]);
    let width = 23;
    let mut rows = vec![vec![Data::Empty; width]; 4];
    let mut header = vec![Data::Empty; width];
    header[1] = s("Institución");
    rows.push(header);
    let mut bank = vec![Data::Empty; width];
    bank[1] = s("BankX");
    bank[4] = Data::Float(100.0); // E CaptacionTotal
    bank[7] = Data::Float(10.0); // H DepositoExigInmediata
    bank[10] = Data::Float(30.0); // K DepositoPlazoPG
    bank[13] = Data::Float(20.0); // N DepositoPlazoMV
    bank[16] = Data::Float(5.0); // Q TitulosCredito
    bank[19] = Data::Float(15.0); // T PrestamosInterBanc
    bank[22] = Data::Float(20.0); // W CuentaGlobalCapt
    rows.push(bank);
    let mut sources = vec![InMemorySheets::new("boletin_2024_01.xlsx").with_sheet("CaptRec", rows)];

    let (outputs, report) = run(&registry, &mut sources);
    assert!(report.skipped.is_empty(), "{:?}", report.skipped);

    let facts = &outputs[0].facts;
    assert_eq!(facts.len(), 4);
    let pairs: Vec<(&str, f64)> = facts
        .iter()
        .map(|f| (f.deposit_type.as_deref().unwrap(), f.value))
        .collect();
    assert_eq!(
        pairs,
        vec![("CtaGlobalCapt", 20.0), ("DepExigInm", 10.0), ("DepPlazo", 50.0), ("Total", 100.0)]
    );
    assert!(facts.iter().all(|f| f.indicator_id == 27 && f.credit_type.is_none()));
}

// -------------------------------------------------------------------------
// BALANCE SHEET
// -------------------------------------------------------------------------

#[test]
fn test_balance_sheet_fans_out_per_indicator() {
    let registry = registry(&["resultados"]);
    let width = 37;
    let mut rows = vec![vec![Data::Empty; width]; 5];
    rows[4][1] = s("Concepto");
    let mut bank = vec![Data::Empty; width];
    bank[1] = s("BankX");
    bank[6] = Data::Float(1000.0); // G ActivoTotal
    bank[12] = Data::Float(300.0); // M Inversiones
    bank[18] = Data::Float(600.0); // S CarteraTotal
    bank[24] = Data::Float(700.0); // Y CaptacionTotal
    bank[30] = Data::Float(100.0); // AE CapitalContable
    bank[36] = Data::Float(10.0); // AK ResultadoNeto
    rows.push(bank);
    let mut sources = vec![InMemorySheets::new("boletin_2024_01.xlsx").with_sheet("Pm2", rows)];

    let (outputs, _) = run(&registry, &mut sources);
    let pairs: Vec<(i32, f64)> = outputs[0]
        .facts
        .iter()
        .map(|f| (f.indicator_id, f.value))
        .collect();
    assert_eq!(
        pairs,
        vec![(24, 1000.0), (25, 100.0), (26, 10.0), (28, 600.0), (27, 700.0)]
    );
    assert!(outputs[0].facts.iter().all(|f| f.credit_type.is_none()));
}

// -------------------------------------------------------------------------
// CSV HAND-OFF
// -------------------------------------------------------------------------

#[test]
fn test_csv_round_trip_maps_to_same_facts() {
    let registry = registry(&["cartera"]);
    let mut sources = vec![
        workbook("boletin_2024_01.xlsx", "CCT", &[("BBVA México", 1_234.5), ("Sistema */", 9_999.0)]),
        workbook("boletin_2024_02.xlsx", "CCT", &[("BBVA México", 1_300.25)]),
    ];
    let (outputs, report) = run(&registry, &mut sources);

    let dir = tempfile::tempdir().unwrap();
    let path = outputs[0].table.write_to_dir(dir.path()).unwrap();
    assert_eq!(path.file_name().unwrap(), "consolidated_data_cartera.csv");

    let read = ConsolidatedTable::read_csv(&path, &registry).unwrap();
    assert_eq!(read, outputs[0].table);
    assert_eq!(map_with_registry(&read, &registry).unwrap(), outputs[0].facts);

    let report_path = dir.path().join("run_report.json");
    report.write_json(&report_path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["families"][0]["family"], "cartera");
    assert_eq!(json["families"][0]["rows"], 3);
}

#[test]
fn test_header_override_shifts_data_rows() {
    let registry = registry(&["cartera"]);
    let tag = TagContext::now();
    let mut report = RunReport::new(tag.ingested_at);
    let mut sources = vec![workbook("boletin_2024_01.xlsx", "CCT", &[("BankX", 1.0), ("BankY", 2.0)])];

    // Row 6 treated as the header: BankX is consumed, BankY remains.
    let outputs = Pipeline::new(&registry, tag)
        .with_header_override(Some(6))
        .run(&mut sources, &mut report);
    let entities: Vec<&str> = outputs[0].table.rows.iter().map(|r| r.entity.as_str()).collect();
    assert_eq!(entities, vec!["BankY"]);
}
