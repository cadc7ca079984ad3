//! Course catalog and enrollments.

pub mod store;

pub use store::{
    Course, CoursePage, CourseQuery, CourseStore, EnrollOutcome, Enrollment, OwnedChange,
    PAGE_SIZE,
};
