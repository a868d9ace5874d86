//! The tables making up the quality-control database.

use crate::{
    sql::db::{Executor, SchemaColumn as Col, Table, Type::*},
    Error, Result,
};

/// Measuring instruments subject to periodic calibration.
pub const INSTRUMENTS: Table = Table {
    name: "instruments",
    columns: &[
        Col::new("code", Text).unique(),
        Col::new("name", Text),
        Col::new("kind", Text),
        Col::new("location", Text),
        Col::new("interval_days", Int8),
        Col::new("last_calibrated", Date).nullable(),
        Col::new("status", Text),
        Col::new("created_at", Timestamp),
        Col::new("updated_at", Timestamp),
    ],
};

/// The calibration history of each instrument.
pub const CALIBRATIONS: Table = Table {
    name: "calibrations",
    columns: &[
        Col::new("instrument_id", Int8).references("instruments"),
        Col::new("calibrated_on", Date),
        Col::new("performed_by", Text),
        Col::new("result", Text),
        Col::new("certificate_no", Text).nullable(),
        Col::new("next_due", Date),
        Col::new("notes", Text).nullable(),
        Col::new("created_at", Timestamp),
    ],
};

/// Receiving inspections of incoming material lots.
pub const INSPECTIONS: Table = Table {
    name: "inspections",
    columns: &[
        Col::new("material_code", Text),
        Col::new("material_name", Text),
        Col::new("supplier", Text),
        Col::new("heat_number", Text),
        Col::new("purchase_order", Text).nullable(),
        Col::new("quantity", Float8),
        Col::new("unit", Text),
        Col::new("received_on", Date),
        Col::new("inspector", Text),
        Col::new("status", Text),
        Col::new("remarks", Text).nullable(),
        Col::new("created_at", Timestamp),
        Col::new("updated_at", Timestamp),
    ],
};

/// Dimensional and visual measurements taken during a receiving inspection.
pub const INSPECTION_MEASUREMENTS: Table = Table {
    name: "inspection_measurements",
    columns: &[
        Col::new("inspection_id", Int8).references("inspections"),
        Col::new("characteristic", Text),
        Col::new("unit", Text).nullable(),
        Col::new("nominal", Float8).nullable(),
        Col::new("lower_limit", Float8).nullable(),
        Col::new("upper_limit", Float8).nullable(),
        Col::new("measured", Float8),
    ],
};

/// Chemical composition analyses of a heat.
pub const CHEMICAL_TESTS: Table = Table {
    name: "chemical_tests",
    columns: &[
        Col::new("heat_number", Text),
        Col::new("grade", Text),
        Col::new("sample_id", Text).nullable(),
        Col::new("laboratory", Text),
        Col::new("tested_on", Date),
        Col::new("analyst", Text),
        Col::new("remarks", Text).nullable(),
        Col::new("created_at", Timestamp),
        Col::new("updated_at", Timestamp),
    ],
};

/// Element concentrations measured in a chemical test.
pub const CHEMICAL_READINGS: Table = Table {
    name: "chemical_readings",
    columns: &[
        Col::new("test_id", Int8).references("chemical_tests"),
        Col::new("element", Text),
        Col::new("measured_pct", Float8),
        Col::new("min_pct", Float8).nullable(),
        Col::new("max_pct", Float8).nullable(),
    ],
};

/// Hardness tests of a batch of parts.
///
/// `instrument_id` is deliberately not a foreign key: deleting an instrument must not cascade to
/// the test results recorded with it.
pub const HARDNESS_TESTS: Table = Table {
    name: "hardness_tests",
    columns: &[
        Col::new("part_number", Text),
        Col::new("batch", Text),
        Col::new("scale", Text),
        Col::new("spec_min", Float8),
        Col::new("spec_max", Float8),
        Col::new("tested_on", Date),
        Col::new("operator", Text),
        Col::new("instrument_id", Int8).nullable(),
        Col::new("remarks", Text).nullable(),
        Col::new("created_at", Timestamp),
        Col::new("updated_at", Timestamp),
    ],
};

/// Individual indentations of a hardness test.
pub const HARDNESS_READINGS: Table = Table {
    name: "hardness_readings",
    columns: &[
        Col::new("test_id", Int8).references("hardness_tests"),
        Col::new("position", Int8),
        Col::new("value", Float8),
    ],
};

/// Periodic KPI figures.
pub const KPI_ENTRIES: Table = Table {
    name: "kpi_entries",
    columns: &[
        Col::new("metric", Text),
        Col::new("period", Date),
        Col::new("target", Float8),
        Col::new("actual", Float8),
        Col::new("unit", Text),
        Col::new("higher_is_better", Bool),
        Col::new("notes", Text).nullable(),
        Col::new("created_at", Timestamp),
        Col::new("updated_at", Timestamp),
    ],
};

/// Files attached to records. The file contents live in the attachment store.
pub const ATTACHMENTS: Table = Table {
    name: "attachments",
    columns: &[
        Col::new("owner_kind", Text),
        Col::new("owner_id", Int8),
        Col::new("file_name", Text),
        Col::new("content_type", Text),
        Col::new("size_bytes", Int8),
        Col::new("stored_name", Text).unique(),
        Col::new("uploaded_by", Text),
        Col::new("uploaded_at", Timestamp),
    ],
};

/// Who changed what, and when.
pub const AUDIT_LOG: Table = Table {
    name: "audit_log",
    columns: &[
        Col::new("table_name", Text),
        Col::new("record_id", Int8),
        Col::new("action", Text),
        Col::new("field", Text).nullable(),
        Col::new("old_value", Text).nullable(),
        Col::new("new_value", Text).nullable(),
        Col::new("changed_by", Text),
        Col::new("changed_at", Timestamp),
    ],
};

/// Every table, ordered so that referenced tables come before the tables referencing them.
pub const TABLES: [Table; 11] = [
    INSTRUMENTS,
    CALIBRATIONS,
    INSPECTIONS,
    INSPECTION_MEASUREMENTS,
    CHEMICAL_TESTS,
    CHEMICAL_READINGS,
    HARDNESS_TESTS,
    HARDNESS_READINGS,
    KPI_ENTRIES,
    ATTACHMENTS,
    AUDIT_LOG,
];

/// Create any tables which do not exist yet.
pub async fn create_tables<E: Executor>(exec: &E) -> Result<()> {
    for table in &TABLES {
        tracing::info!("creating table {}", table.name);
        exec.create_table(table).await.map_err(Error::db)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::db::memory;
    use std::collections::HashSet;

    #[test]
    fn test_references_are_ordered() {
        let mut seen = HashSet::new();
        for table in &TABLES {
            for col in table.columns {
                if let Some(foreign) = col.foreign_table() {
                    assert!(
                        seen.contains(foreign),
                        "{} references {foreign} before it is created",
                        table.name
                    );
                }
            }
            seen.insert(table.name);
        }
    }

    #[async_std::test]
    async fn test_create_tables_is_idempotent() {
        let db = memory::Connection::create();
        create_tables(&db).await.unwrap();
        create_tables(&db).await.unwrap();
    }
}
