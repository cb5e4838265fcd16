//! Seat allocation engine.
//!
//! Pure functions over halls and candidate students; persistence lives in
//! `slots`. Seats are visited hall by hall, column-major inside a hall, and
//! carry a global seat number that counts every visited seat whether or not
//! it is filled.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Department separation enforced seat by seat.
    Separated,
    /// Round-robin across groups, seated contiguously.
    Interleave,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "separated" => Some(Self::Separated),
            "interleave" => Some(Self::Interleave),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Separated => "separated",
            Self::Interleave => "interleave",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparationKey {
    Department,
    RollPrefix,
}

impl SeparationKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "department" => Some(Self::Department),
            "rollPrefix" => Some(Self::RollPrefix),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjacency {
    /// Same row, neighbouring columns.
    SideBySide,
    /// Side by side plus front and back.
    FourWay,
}

impl Adjacency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sideBySide" => Some(Self::SideBySide),
            "fourWay" => Some(Self::FourWay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub strategy: Strategy,
    pub key: SeparationKey,
    pub adjacency: Adjacency,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            strategy: Strategy::Separated,
            key: SeparationKey::Department,
            adjacency: Adjacency::SideBySide,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HallGrid {
    pub id: String,
    pub name: String,
    pub rows: u32,
    pub columns: u32,
}

impl HallGrid {
    pub fn capacity(&self) -> usize {
        self.rows as usize * self.columns as usize
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub roll_no: String,
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub student_id: String,
    pub hall_id: String,
    pub seat_no: u32,
    pub row: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationPlan {
    pub placements: Vec<Placement>,
    pub groups: Vec<String>,
    pub constraint_applied: bool,
    pub empty_seats: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no halls selected")]
    NoHalls,
    #[error("insufficient capacity: {students} students, {capacity} seats")]
    InsufficientCapacity { students: usize, capacity: usize },
    #[error(
        "department separation cannot be satisfied: {unplaced} of {students} students left without a seat ({seats} seats)"
    )]
    Infeasible {
        unplaced: usize,
        students: usize,
        seats: usize,
    },
}

/// Seat already taken by another exam sharing the slot: `(hall_id, row, col)`.
pub type Reserved = HashSet<(String, u32, u32)>;

#[derive(Debug, Clone, Copy)]
struct SeatPos {
    hall: usize,
    row: u32,
    col: u32,
    seat_no: u32,
}

/// Characters 3..=6 of a roll number, upper-cased (`24CSCS001` -> `CSCS`).
pub fn roll_prefix(roll_no: &str) -> Option<String> {
    let chars: Vec<char> = roll_no.trim().chars().collect();
    if chars.len() < 3 {
        return None;
    }
    let end = chars.len().min(6);
    Some(chars[2..end].iter().collect::<String>().to_uppercase())
}

pub fn group_key(candidate: &Candidate, key: SeparationKey) -> String {
    let department = || candidate.department_id.clone().unwrap_or_default();
    match key {
        SeparationKey::Department => department(),
        SeparationKey::RollPrefix => roll_prefix(&candidate.roll_no).unwrap_or_else(department),
    }
}

fn seat_order(halls: &[HallGrid]) -> Vec<SeatPos> {
    let mut seats = Vec::with_capacity(halls.iter().map(HallGrid::capacity).sum());
    let mut seat_no = 0u32;
    for (hall, grid) in halls.iter().enumerate() {
        for col in 1..=grid.columns {
            for row in 1..=grid.rows {
                seat_no += 1;
                seats.push(SeatPos {
                    hall,
                    row,
                    col,
                    seat_no,
                });
            }
        }
    }
    seats
}

fn placement(halls: &[HallGrid], seat: SeatPos, student: &Candidate) -> Placement {
    Placement {
        student_id: student.id.clone(),
        hall_id: halls[seat.hall].id.clone(),
        seat_no: seat.seat_no,
        row: seat.row,
        col: seat.col,
    }
}

pub fn allocate(
    halls: &[HallGrid],
    candidates: &[Candidate],
    policy: &Policy,
) -> Result<AllocationPlan, AllocationError> {
    allocate_with_reserved(halls, candidates, policy, &Reserved::new())
}

pub fn allocate_with_reserved(
    halls: &[HallGrid],
    candidates: &[Candidate],
    policy: &Policy,
    reserved: &Reserved,
) -> Result<AllocationPlan, AllocationError> {
    if halls.is_empty() {
        return Err(AllocationError::NoHalls);
    }
    let seats: Vec<SeatPos> = seat_order(halls)
        .into_iter()
        .filter(|s| !reserved.contains(&(halls[s.hall].id.clone(), s.row, s.col)))
        .collect();
    if candidates.is_empty() {
        return Ok(AllocationPlan {
            empty_seats: seats.len(),
            ..AllocationPlan::default()
        });
    }
    if candidates.len() > seats.len() {
        return Err(AllocationError::InsufficientCapacity {
            students: candidates.len(),
            capacity: seats.len(),
        });
    }

    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.roll_no.cmp(&b.roll_no).then_with(|| a.id.cmp(&b.id)));
    let mut groups: BTreeMap<String, VecDeque<&Candidate>> = BTreeMap::new();
    for c in sorted.iter().copied() {
        groups.entry(group_key(c, policy.key)).or_default().push_back(c);
    }
    let group_names: Vec<String> = groups.keys().cloned().collect();

    let (placements, constraint_applied) = match policy.strategy {
        Strategy::Interleave => (fill_in_order(halls, &seats, &interleave(groups)), false),
        Strategy::Separated if groups.len() < 2 => (fill_in_order(halls, &seats, &sorted), false),
        Strategy::Separated => (fill_separated(halls, &seats, groups, policy.adjacency)?, true),
    };

    Ok(AllocationPlan {
        empty_seats: seats.len() - placements.len(),
        placements,
        groups: group_names,
        constraint_applied,
    })
}

/// A B C A B C ... with groups in key order and roll order inside a group.
fn interleave(mut groups: BTreeMap<String, VecDeque<&Candidate>>) -> Vec<&Candidate> {
    let mut out = Vec::new();
    loop {
        let mut took = false;
        for queue in groups.values_mut() {
            if let Some(c) = queue.pop_front() {
                out.push(c);
                took = true;
            }
        }
        if !took {
            break;
        }
    }
    out
}

fn fill_in_order(halls: &[HallGrid], seats: &[SeatPos], order: &[&Candidate]) -> Vec<Placement> {
    order
        .iter()
        .zip(seats.iter())
        .map(|(student, seat)| placement(halls, *seat, student))
        .collect()
}

fn fill_separated(
    halls: &[HallGrid],
    seats: &[SeatPos],
    groups: BTreeMap<String, VecDeque<&Candidate>>,
    adjacency: Adjacency,
) -> Result<Vec<Placement>, AllocationError> {
    let total: usize = groups.values().map(VecDeque::len).sum();
    let mut queues: Vec<VecDeque<&Candidate>> = groups.into_values().collect();
    let mut occupied: HashMap<(usize, u32, u32), usize> = HashMap::new();
    let mut placements = Vec::with_capacity(total);

    for seat in seats {
        if placements.len() == total {
            break;
        }
        let left = occupied.get(&(seat.hall, seat.row, seat.col.wrapping_sub(1))).copied();
        let above = occupied.get(&(seat.hall, seat.row.wrapping_sub(1), seat.col)).copied();
        let blocked = |g: usize| {
            left == Some(g) || (adjacency == Adjacency::FourWay && above == Some(g))
        };

        let eligible: Vec<usize> = (0..queues.len())
            .filter(|&g| !queues[g].is_empty() && !blocked(g))
            .collect();
        let choice = match above {
            Some(a) if eligible.contains(&a) => Some(a),
            // Most remaining first; on a tie the lower index, i.e. the smaller key.
            _ => eligible
                .iter()
                .copied()
                .max_by(|&a, &b| queues[a].len().cmp(&queues[b].len()).then(b.cmp(&a))),
        };
        let Some(g) = choice else { continue };
        let Some(student) = queues[g].pop_front() else { continue };
        occupied.insert((seat.hall, seat.row, seat.col), g);
        placements.push(placement(halls, *seat, student));
    }

    if placements.len() < total {
        return Err(AllocationError::Infeasible {
            unplaced: total - placements.len(),
            students: total,
            seats: seats.len(),
        });
    }
    Ok(placements)
}

#[derive(Debug, Clone)]
pub struct SeatedGroup {
    pub hall_id: String,
    pub row: u32,
    pub col: u32,
    pub group: String,
}

/// Counts neighbouring seat pairs that hold the same group.
pub fn count_violations(seated: &[SeatedGroup], adjacency: Adjacency) -> usize {
    let by_pos: HashMap<(&str, u32, u32), &str> = seated
        .iter()
        .map(|s| ((s.hall_id.as_str(), s.row, s.col), s.group.as_str()))
        .collect();
    let mut violations = 0;
    for s in seated {
        let right = by_pos.get(&(s.hall_id.as_str(), s.row, s.col + 1));
        if right == Some(&s.group.as_str()) {
            violations += 1;
        }
        if adjacency == Adjacency::FourWay {
            let below = by_pos.get(&(s.hall_id.as_str(), s.row + 1, s.col));
            if below == Some(&s.group.as_str()) {
                violations += 1;
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hall(id: &str, rows: u32, columns: u32) -> HallGrid {
        HallGrid {
            id: id.to_string(),
            name: id.to_string(),
            rows,
            columns,
        }
    }

    fn students(dept: &str, prefix: &str, n: usize) -> Vec<Candidate> {
        (1..=n)
            .map(|i| Candidate {
                id: format!("{}-{}", dept, i),
                roll_no: format!("24{}{:03}", prefix, i),
                department_id: Some(dept.to_string()),
            })
            .collect()
    }

    fn seated(plan: &AllocationPlan, all: &[Candidate], key: SeparationKey) -> Vec<SeatedGroup> {
        let by_id: HashMap<&str, &Candidate> = all.iter().map(|c| (c.id.as_str(), c)).collect();
        plan.placements
            .iter()
            .map(|p| SeatedGroup {
                hall_id: p.hall_id.clone(),
                row: p.row,
                col: p.col,
                group: group_key(by_id[p.student_id.as_str()], key),
            })
            .collect()
    }

    #[test]
    fn roll_prefix_takes_characters_three_to_six() {
        assert_eq!(roll_prefix("24cscs001").as_deref(), Some("CSCS"));
        assert_eq!(roll_prefix("24MBA").as_deref(), Some("MBA"));
        assert_eq!(roll_prefix("7"), None);
    }

    #[test]
    fn rejects_missing_halls_and_overflow() {
        let s = students("cs", "CSCS", 5);
        assert_eq!(
            allocate(&[], &s, &Policy::default()),
            Err(AllocationError::NoHalls)
        );
        assert_eq!(
            allocate(&[hall("h1", 2, 2)], &s, &Policy::default()),
            Err(AllocationError::InsufficientCapacity {
                students: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn no_students_is_an_empty_plan() {
        let plan = allocate(&[hall("h1", 2, 3)], &[], &Policy::default()).expect("plan");
        assert!(plan.placements.is_empty());
        assert_eq!(plan.empty_seats, 6);
    }

    #[test]
    fn two_departments_alternate_by_column() {
        let mut all = students("cs", "CSCS", 4);
        all.extend(students("ma", "MATH", 4));
        let plan = allocate(&[hall("h1", 2, 4)], &all, &Policy::default()).expect("plan");
        assert!(plan.constraint_applied);
        assert_eq!(plan.placements.len(), 8);
        assert_eq!(
            count_violations(&seated(&plan, &all, SeparationKey::Department), Adjacency::SideBySide),
            0
        );
        // Column 1 holds the first group top to bottom.
        let col1: Vec<&str> = plan
            .placements
            .iter()
            .filter(|p| p.col == 1)
            .map(|p| p.student_id.as_str())
            .collect();
        assert_eq!(col1, vec!["cs-1", "cs-2"]);
        let col2_depts: HashSet<&str> = plan
            .placements
            .iter()
            .filter(|p| p.col == 2)
            .map(|p| p.student_id.split('-').next().unwrap_or(""))
            .collect();
        assert_eq!(col2_depts, HashSet::from(["ma"]));
    }

    #[test]
    fn four_way_adjacency_forms_a_checkerboard() {
        let mut all = students("cs", "CSCS", 8);
        all.extend(students("ma", "MATH", 8));
        let policy = Policy {
            adjacency: Adjacency::FourWay,
            ..Policy::default()
        };
        let plan = allocate(&[hall("h1", 4, 4)], &all, &policy).expect("plan");
        assert_eq!(plan.placements.len(), 16);
        assert_eq!(
            count_violations(&seated(&plan, &all, SeparationKey::Department), Adjacency::FourWay),
            0
        );
    }

    #[test]
    fn dominant_department_that_cannot_be_separated_is_infeasible() {
        let mut all = students("cs", "CSCS", 10);
        all.extend(students("ma", "MATH", 2));
        let err = allocate(&[hall("h1", 2, 6)], &all, &Policy::default()).expect_err("infeasible");
        assert_eq!(
            err,
            AllocationError::Infeasible {
                unplaced: 4,
                students: 12,
                seats: 12
            }
        );
    }

    #[test]
    fn single_group_is_seated_contiguously() {
        let all = students("cs", "CSCS", 5);
        let plan = allocate(&[hall("h1", 2, 3)], &all, &Policy::default()).expect("plan");
        assert!(!plan.constraint_applied);
        let seat_nos: Vec<u32> = plan.placements.iter().map(|p| p.seat_no).collect();
        assert_eq!(seat_nos, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn interleave_round_robins_groups() {
        let mut all = students("ma", "MATH", 2);
        all.extend(students("cs", "CSCS", 3));
        let policy = Policy {
            strategy: Strategy::Interleave,
            ..Policy::default()
        };
        let plan = allocate(&[hall("h1", 5, 1)], &all, &policy).expect("plan");
        let order: Vec<&str> = plan.placements.iter().map(|p| p.student_id.as_str()).collect();
        assert_eq!(order, vec!["cs-1", "ma-1", "cs-2", "ma-2", "cs-3"]);
    }

    #[test]
    fn seat_numbers_continue_across_halls() {
        let mut all = students("cs", "CSCS", 3);
        all.extend(students("ma", "MATH", 3));
        let plan = allocate(&[hall("a", 2, 2), hall("b", 2, 2)], &all, &Policy::default())
            .expect("plan");
        let in_b: Vec<u32> = plan
            .placements
            .iter()
            .filter(|p| p.hall_id == "b")
            .map(|p| p.seat_no)
            .collect();
        assert!(!in_b.is_empty());
        assert!(in_b.iter().all(|n| *n > 4));
    }

    #[test]
    fn roll_prefix_key_separates_within_a_department() {
        let mut all = students("cscs", "CSCS", 3);
        all.extend(students("csae", "CSAE", 3));
        for c in all.iter_mut() {
            c.department_id = Some("eng".to_string());
        }
        let policy = Policy {
            key: SeparationKey::RollPrefix,
            ..Policy::default()
        };
        let plan = allocate(&[hall("h1", 3, 2)], &all, &policy).expect("plan");
        assert!(plan.constraint_applied);
        assert_eq!(plan.groups, vec!["CSAE".to_string(), "CSCS".to_string()]);
        assert_eq!(
            count_violations(&seated(&plan, &all, SeparationKey::RollPrefix), Adjacency::SideBySide),
            0
        );
    }

    #[test]
    fn reserved_seats_are_skipped() {
        let all = students("cs", "CSCS", 2);
        let reserved: Reserved = HashSet::from([("h1".to_string(), 1, 1)]);
        let plan = allocate_with_reserved(&[hall("h1", 2, 1)], &all, &Policy::default(), &reserved);
        assert_eq!(
            plan,
            Err(AllocationError::InsufficientCapacity {
                students: 2,
                capacity: 1
            })
        );
        let plan = allocate_with_reserved(&[hall("h1", 3, 1)], &all, &Policy::default(), &reserved)
            .expect("plan");
        let rows: Vec<u32> = plan.placements.iter().map(|p| p.row).collect();
        assert_eq!(rows, vec![2, 3]);
    }
}
