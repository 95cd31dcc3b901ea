/*!
 * End-to-end tests: CSV extract on disk -> SQLite database -> queries
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use medbill::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;

const CMS_HEADER: &str = "Rndrng_NPI,Rndrng_Prvdr_Last_Org_Name,Rndrng_Prvdr_Type,Rndrng_Prvdr_State_Abrvtn,HCPCS_Cd,HCPCS_Desc,Place_Of_Srvc,Tot_Srvcs,Avg_Mdcr_Pymt_Amt";

fn write_csv(dir: &Path, name: &str, header: &str, rows: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut contents = String::from(header);
    for row in rows {
        contents.push('\n');
        contents.push_str(row);
    }
    contents.push('\n');
    fs::write(&path, contents).unwrap();
    path
}

fn row(npi: &str, name: &str, specialty: &str, state: &str, code: &str, place: &str, services: u32, payment: &str) -> String {
    format!("{npi},{name},{specialty},{state},{code},Desc {code},{place},{services},{payment}")
}

fn quiet() -> BillingConfig {
    ConfigBuilder::new().progress_bar(false).build().unwrap()
}

fn load(dir: &TempDir, rows: &[String]) -> BillingDataset {
    let input = write_csv(dir.path(), "extract.csv", CMS_HEADER, rows);
    BillingDatasetBuilder::new()
        .database(dir.path().join("billing.db"))
        .input_file(input)
        .config(quiet())
        .build()
        .unwrap()
}

fn five_providers() -> Vec<String> {
    vec![
        row("1000000005", "Evans", "Oncology", "TX", "99213", "O", 1, "10"),
        row("1000000002", "Brown", "Cardiology", "CA", "99213", "O", 1, "10"),
        row("1000000004", "Davis", "Cardiology", "NY", "99213", "F", 1, "10"),
        row("1000000001", "Adams", "Cardiology", "CA", "99213", "O", 1, "10"),
        row("1000000003", "Clark", "Dermatology", "CA", "99213", "O", 1, "10"),
    ]
}

fn npis(page: &ProviderPage) -> Vec<&str> {
    page.providers.iter().map(|p| p.npi.as_str()).collect()
}

#[test]
fn ingest_counts_providers_and_records_exactly() {
    let dir = TempDir::new().unwrap();
    let dataset = load(
        &dir,
        &[
            row("1000000001", "Smith", "Cardiology", "CA", "99213", "O", 3, "100.00"),
            row("1000000001", "Smith Renamed", "Oncology", "NV", "99214", "F", 1, "50.00"),
            row("1000000002", "Jones", "Cardiology", "NY", "99213", "O", 2, "300.00"),
            row("", "Nobody", "Cardiology", "NY", "99213", "O", 2, "300.00"),
            row("1000000003", "Bad", "Cardiology", "NY", "99213", "O", 2, "lots"),
        ],
    );

    let summary = dataset.ingest_summary().unwrap();
    assert_eq!(summary.providers_loaded, 2);
    assert_eq!(summary.records_loaded, 3);
    assert_eq!(summary.rows_read, 5);
    assert_eq!(summary.rows_skipped, 2);

    let stats = dataset.statistics().unwrap();
    assert_eq!(stats.provider_count, 2);
    assert_eq!(stats.record_count, 3);
    assert_eq!(stats.index_names.len(), 4);

    // first occurrence decides the provider attributes
    let smith = dataset.queries().unwrap().get_provider("1000000001").unwrap().unwrap();
    assert_eq!(smith.name, "Smith");
    assert_eq!(smith.specialty, "Cardiology");
    assert_eq!(smith.state, "CA");
}

#[test]
fn blank_optional_fields_get_fallbacks() {
    let dir = TempDir::new().unwrap();
    let dataset = load(&dir, &["1000000001,,,,,,,4,12.50".to_string()]);

    let queries = dataset.queries().unwrap();
    let provider = queries.get_provider("1000000001").unwrap().unwrap();
    assert_eq!(provider.name, "Unknown");
    assert_eq!(provider.specialty, "Unknown");
    assert_eq!(provider.state, "Unknown");

    let top = queries.top_billing_records("1000000001", None).unwrap();
    assert_eq!(top[0].record.procedure_code, "UNKNOWN");
    assert_eq!(top[0].record.procedure_description, "N/A");
    assert_eq!(top[0].record.place_of_service, "N/A");
    assert_eq!(top[0].record.service_count, 4);
    assert_eq!(top[0].record.total_payment, Decimal::new(1250, 2));
}

#[test]
fn headers_match_case_insensitively_with_plain_names() {
    let dir = TempDir::new().unwrap();
    let header = "NPI,Provider_Name,SPECIALTY,State,Procedure_Code,Procedure_Description,Place_Of_Service,Service_Count,Total_Payment";
    let input = write_csv(
        dir.path(),
        "plain.csv",
        header,
        &[row("1000000001", "Smith", "Cardiology", "CA", "99213", "O", 1, "75.25")],
    );

    let dataset = BillingDatasetBuilder::new()
        .database(dir.path().join("billing.db"))
        .input_file(input)
        .config(quiet())
        .build()
        .unwrap();

    assert_eq!(dataset.averages().get("99213"), Some(Decimal::new(7525, 2)));
}

#[test]
fn reingest_replaces_previous_contents() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("billing.db");
    let first = write_csv(
        dir.path(),
        "first.csv",
        CMS_HEADER,
        &[
            row("1000000001", "Smith", "Cardiology", "CA", "99213", "O", 1, "100"),
            row("1000000002", "Jones", "Cardiology", "NY", "99213", "O", 1, "100"),
        ],
    );
    let second = write_csv(
        dir.path(),
        "second.csv",
        CMS_HEADER,
        &[row("1000000009", "Lee", "Oncology", "TX", "99214", "F", 1, "40")],
    );

    for input in [&first, &second] {
        BillingDatasetBuilder::new()
            .database(&db_path)
            .input_file(input)
            .config(quiet())
            .build()
            .unwrap();
    }

    let dataset = BillingDataset::open(&db_path).unwrap();
    let stats = dataset.statistics().unwrap();
    assert_eq!(stats.provider_count, 1);
    assert_eq!(stats.record_count, 1);
    assert_eq!(dataset.averages().get("99213"), None);
    assert_eq!(dataset.queries().unwrap().distinct_states().unwrap(), vec!["TX"]);
}

#[test]
fn missing_input_leaves_database_untouched() {
    let dir = TempDir::new().unwrap();
    let dataset = load(&dir, &five_providers());

    let mut db = Database::open(dataset.database_path()).unwrap();
    let err = BulkLoader::new()
        .ingest(dir.path().join("does_not_exist.csv"), &mut db)
        .unwrap_err();

    assert!(matches!(err, BillingError::FileNotFound { .. }));
    assert_eq!(db.provider_count().unwrap(), 5);
    assert_eq!(db.record_count().unwrap(), 5);
}

#[test]
fn national_average_matches_hand_computed_mean() {
    let dir = TempDir::new().unwrap();
    let dataset = load(
        &dir,
        &[
            row("1000000001", "A", "Cardiology", "CA", "X", "O", 1, "100"),
            row("1000000002", "B", "Cardiology", "CA", "X", "O", 1, "200"),
            row("1000000003", "C", "Cardiology", "CA", "X", "O", 1, "300"),
            row("1000000003", "C", "Cardiology", "CA", "Y", "O", 1, "0.01"),
            row("1000000003", "C", "Cardiology", "CA", "Y", "O", 1, "0.02"),
        ],
    );

    assert_eq!(dataset.averages().get("X"), Some(Decimal::from(200)));
    assert_eq!(dataset.averages().get("Y"), Some(Decimal::new(15, 3)));
    assert_eq!(dataset.averages().get("NOPE"), None);

    let before = dataset.averages().snapshot();
    let after = dataset.reload_averages().unwrap();
    assert_eq!(*before, *after);
}

#[test]
fn averages_hold_when_code_totals_exceed_64_bits() {
    let dir = TempDir::new().unwrap();
    let dataset = load(
        &dir,
        &[
            row("1000000001", "A", "Cardiology", "CA", "X", "O", 1, "500000000000000"),
            row("1000000002", "B", "Cardiology", "CA", "X", "O", 1, "500000000000000"),
        ],
    );

    assert_eq!(dataset.averages().get("X"), Some(Decimal::from(500_000_000_000_000_i64)));
}

#[test]
fn search_pages_are_ordered_by_npi() {
    let dir = TempDir::new().unwrap();
    let dataset = load(&dir, &five_providers());
    let queries = dataset.queries().unwrap();

    let page = queries
        .search_providers(&ProviderSearch::new().page(2).page_size(2))
        .unwrap();
    assert_eq!(page.total_count, 5);
    assert_eq!(npis(&page), vec!["1000000003", "1000000004"]);

    let last = queries
        .search_providers(&ProviderSearch::new().page(3).page_size(2))
        .unwrap();
    assert_eq!(npis(&last), vec!["1000000005"]);

    let beyond = queries
        .search_providers(&ProviderSearch::new().page(4).page_size(2))
        .unwrap();
    assert!(beyond.providers.is_empty());
    assert_eq!(beyond.total_count, 5);
}

#[test]
fn out_of_range_pages_return_empty_page_with_count() {
    let dir = TempDir::new().unwrap();
    let dataset = load(&dir, &five_providers());
    let queries = dataset.queries().unwrap();

    for request in [
        ProviderSearch::new().page(0),
        ProviderSearch::new().page_size(0),
        ProviderSearch::new().page(3).page_size(5),
        ProviderSearch::new().page(u32::MAX).page_size(u32::MAX),
    ] {
        let page = queries.search_providers(&request).unwrap();
        assert!(page.providers.is_empty());
        assert_eq!(page.total_count, 5);
    }
}

#[test]
fn search_filters_combine() {
    let dir = TempDir::new().unwrap();
    let dataset = load(&dir, &five_providers());
    let queries = dataset.queries().unwrap();

    let by_name = queries.search_providers(&ProviderSearch::new().search("a")).unwrap();
    assert_eq!(npis(&by_name), vec!["1000000001", "1000000003", "1000000004", "1000000005"]);

    // substring matching is case-sensitive
    let upper = queries.search_providers(&ProviderSearch::new().search("A")).unwrap();
    assert_eq!(npis(&upper), vec!["1000000001"]);

    let by_npi = queries.search_providers(&ProviderSearch::new().search("0005")).unwrap();
    assert_eq!(npis(&by_npi), vec!["1000000005"]);

    let ca_cardiology = queries
        .search_providers(&ProviderSearch::new().state("CA").specialty("Cardiology"))
        .unwrap();
    assert_eq!(npis(&ca_cardiology), vec!["1000000001", "1000000002"]);

    let exact_only = queries.search_providers(&ProviderSearch::new().state("C")).unwrap();
    assert_eq!(exact_only.total_count, 0);

    let blank = queries
        .search_providers(&ProviderSearch::new().search("").state(" ").specialty(""))
        .unwrap();
    assert_eq!(blank.total_count, 5);
}

#[test]
fn distinct_lists_are_sorted() {
    let dir = TempDir::new().unwrap();
    let dataset = load(&dir, &five_providers());
    let queries = dataset.queries().unwrap();

    assert_eq!(queries.distinct_states().unwrap(), vec!["CA", "NY", "TX"]);
    assert_eq!(
        queries.distinct_specialties().unwrap(),
        vec!["Cardiology", "Dermatology", "Oncology"]
    );
    assert_eq!(queries.distinct_places_of_service("1000000004").unwrap(), vec!["F"]);
    assert!(queries.distinct_places_of_service("9999999999").unwrap().is_empty());
}

#[test]
fn top_billing_records_keeps_ten_highest() {
    let dir = TempDir::new().unwrap();
    let mut rows: Vec<String> = (1..=15)
        .map(|i| {
            let place = if i % 2 == 0 { "F" } else { "O" };
            row("1000000001", "Smith", "Cardiology", "CA", &format!("C{i:02}"), place, 1, &format!("{i}.00"))
        })
        .collect();
    rows.push(row("1000000002", "Jones", "Cardiology", "CA", "C15", "O", 1, "5.00"));
    let dataset = load(&dir, &rows);
    let queries = dataset.queries().unwrap();

    let top = queries.top_billing_records("1000000001", None).unwrap();
    assert_eq!(top.len(), 10);
    let payments: Vec<Decimal> = top.iter().map(|r| r.record.total_payment).collect();
    let expected: Vec<Decimal> = (6..=15).rev().map(Decimal::from).collect();
    assert_eq!(payments, expected);

    assert_eq!(top[0].record.procedure_code, "C15");
    assert_eq!(top[0].national_average, Some(Decimal::new(10, 0)));
    assert_eq!(top[0].difference_from_average(), Some(Decimal::from(5)));

    let facility = queries.top_billing_records("1000000001", Some("F")).unwrap();
    assert_eq!(facility.len(), 7);
    assert!(facility.iter().all(|r| r.record.place_of_service == "F"));

    assert!(queries.top_billing_records("9999999999", None).unwrap().is_empty());
}

#[test]
fn equal_payments_keep_file_order() {
    let dir = TempDir::new().unwrap();
    let dataset = load(
        &dir,
        &[
            row("1000000001", "Smith", "Cardiology", "CA", "B", "O", 1, "50"),
            row("1000000001", "Smith", "Cardiology", "CA", "A", "O", 1, "50"),
            row("1000000001", "Smith", "Cardiology", "CA", "C", "O", 1, "80"),
        ],
    );

    let top = dataset.queries().unwrap().top_billing_records("1000000001", None).unwrap();
    let codes: Vec<&str> = top.iter().map(|r| r.record.procedure_code.as_str()).collect();
    assert_eq!(codes, vec!["C", "B", "A"]);
}

#[test]
fn concurrent_readers_see_consistent_averages_during_reload() {
    let dir = TempDir::new().unwrap();
    let dataset = load(
        &dir,
        &[
            row("1000000001", "A", "Cardiology", "CA", "X", "O", 1, "100"),
            row("1000000002", "B", "Cardiology", "CA", "X", "O", 1, "300"),
        ],
    );

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let queries = dataset.queries().unwrap();
            thread::spawn(move || {
                for _ in 0..50 {
                    let top = queries.top_billing_records("1000000001", None).unwrap();
                    assert_eq!(top[0].national_average, Some(Decimal::from(200)));
                }
            })
        })
        .collect();

    for _ in 0..10 {
        dataset.reload_averages().unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
}
